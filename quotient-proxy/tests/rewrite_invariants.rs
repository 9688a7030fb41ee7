//! Structural invariants of the rewrite pipeline, checked by re-parsing
//! the rewritten statements rather than by string comparison alone.

use std::collections::HashMap;

use quotient_proxy::sql::parser::{parse, LiteralKind, Statement};
use quotient_proxy::sql::{rewrite_query, Rewrite};
use quotient_shared::config::{ColumnRule, ConversionSnapshot, TableRule};
use quotient_shared::rounding::RoundingMode;

fn snapshot() -> ConversionSnapshot {
    ConversionSnapshot {
        ratio: 1000,
        precision: 4,
        rounding_mode: RoundingMode::Bankers,
        tables: HashMap::from([(
            "orders".to_string(),
            TableRule {
                enabled: true,
                columns: HashMap::from([
                    (
                        "total_amount".to_string(),
                        ColumnRule {
                            target_column: "total_amount_idn".to_string(),
                            precision: None,
                            rounding_mode: None,
                        },
                    ),
                    (
                        "shipping_fee".to_string(),
                        ColumnRule {
                            target_column: "shipping_fee_idn".to_string(),
                            precision: None,
                            rounding_mode: None,
                        },
                    ),
                ]),
            },
        )]),
    }
    .normalized()
}

fn rewritten(statement: &str) -> String {
    match rewrite_query(statement, &snapshot()) {
        Rewrite::Replaced(out) => out,
        Rewrite::Unchanged => panic!("expected rewrite for: {statement}"),
    }
}

#[test]
fn insert_rewrites_extend_columns_and_every_row() {
    let cases = [
        "INSERT INTO orders (customer_id, total_amount) VALUES (1, 500000)",
        "INSERT INTO orders (customer_id, total_amount, shipping_fee) VALUES (1, 2, 3)",
        "INSERT INTO orders (note, total_amount) VALUES ('x', 42), ('y', -42), ('z', 0)",
        "insert into ORDERS (`Total_Amount`) values (999999)",
    ];

    for case in cases {
        let original = match parse(case).unwrap() {
            Statement::Insert(stmt) => stmt,
            other => panic!("bad fixture {case}: {other:?}"),
        };
        let currency_count = original
            .columns
            .iter()
            .filter(|c| {
                matches!(
                    c.name.to_ascii_lowercase().as_str(),
                    "total_amount" | "shipping_fee"
                )
            })
            .count();

        let out = rewritten(case);
        let reparsed = match parse(&out).unwrap() {
            Statement::Insert(stmt) => stmt,
            other => panic!("rewrite of {case} no longer parses as insert: {other:?}"),
        };

        // One appended column per currency column, one appended value per
        // row, every original column and literal preserved in place.
        assert_eq!(
            reparsed.columns.len(),
            original.columns.len() + currency_count,
            "{case}"
        );
        assert_eq!(reparsed.rows.len(), original.rows.len(), "{case}");
        for (i, column) in original.columns.iter().enumerate() {
            assert_eq!(reparsed.columns[i].name, column.name, "{case}");
        }
        for (row_index, row) in original.rows.iter().enumerate() {
            let new_row = &reparsed.rows[row_index];
            assert_eq!(new_row.values.len(), row.values.len() + currency_count);
            for (value_index, value) in row.values.iter().enumerate() {
                assert_eq!(
                    value.text(case),
                    new_row.values[value_index].text(&out),
                    "{case}"
                );
            }
            // Appended literals are fixed-point decimals.
            for appended in &new_row.values[row.values.len()..] {
                assert_eq!(appended.kind, LiteralKind::Float, "{case}");
                let text = appended.text(&out);
                let fraction = text.rsplit('.').next().unwrap();
                assert_eq!(fraction.len(), 4, "{case}: {text}");
            }
        }
    }
}

#[test]
fn update_rewrites_preserve_the_tail_byte_for_byte() {
    let cases = [
        (
            "UPDATE orders SET total_amount = 750000 WHERE id = 123",
            " WHERE id = 123",
        ),
        (
            "UPDATE orders SET shipping_fee = 1, note = 'x' WHERE a = 1 AND b IN (2, 3)",
            " WHERE a = 1 AND b IN (2, 3)",
        ),
        (
            "UPDATE orders SET total_amount = 5000 ORDER BY id LIMIT 3",
            " ORDER BY id LIMIT 3",
        ),
    ];

    for (case, tail) in cases {
        let out = rewritten(case);
        assert!(out.ends_with(tail), "{case} -> {out}");

        let original = match parse(case).unwrap() {
            Statement::Update(stmt) => stmt,
            other => panic!("bad fixture {case}: {other:?}"),
        };
        let reparsed = match parse(&out).unwrap() {
            Statement::Update(stmt) => stmt,
            other => panic!("rewrite of {case} no longer parses as update: {other:?}"),
        };

        assert_eq!(
            reparsed.assignments.len(),
            original.assignments.len() + 1,
            "{case}"
        );
        for (i, assignment) in original.assignments.iter().enumerate() {
            assert_eq!(
                reparsed.assignments[i].column.name, assignment.column.name,
                "{case}"
            );
            assert_eq!(
                assignment.value.text(case),
                reparsed.assignments[i].value.text(&out),
                "{case}"
            );
        }
        let appended = reparsed.assignments.last().unwrap();
        assert!(appended.column.name.ends_with("_idn"), "{case}");
    }
}

#[test]
fn rewrite_is_idempotent_across_reparse() {
    let cases = [
        "INSERT INTO orders (customer_id, total_amount) VALUES (1, 500000)",
        "UPDATE orders SET total_amount = 750000, shipping_fee = 25000 WHERE id = 1",
    ];
    for case in cases {
        let once = rewritten(case);
        assert_eq!(
            rewrite_query(&once, &snapshot()),
            Rewrite::Unchanged,
            "{case}"
        );
    }
}
