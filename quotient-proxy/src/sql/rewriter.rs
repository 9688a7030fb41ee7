//! Dual-write statement rewriting.
//!
//! Given a COM_QUERY text and the current conversion snapshot, produce
//! either the original statement or an equivalent one that also writes the
//! converted decimal into each configured shadow column. The pipeline is
//! fail-open: anything it cannot rewrite is forwarded unchanged.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use quotient_shared::config::{ConversionSnapshot, TableRule};
use quotient_shared::rounding::{parse_decimal, Engine};

use super::parser::{parse, InsertStatement, LiteralKind, Statement, UpdateStatement, ValueLiteral};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Forward the original bytes.
    Unchanged,
    /// Substitute the rewritten statement.
    Replaced(String),
}

/// Rewrite a statement for dual-write, consulting the snapshot's table
/// rules. Returns `Unchanged` whenever the statement is not a rewritable
/// INSERT/UPDATE on a configured table.
pub fn rewrite_query(query: &str, snapshot: &ConversionSnapshot) -> Rewrite {
    let statement = match parse(query) {
        Ok(statement) => statement,
        Err(error) => {
            warn!(error = %error, "statement parse failed; forwarding unchanged");
            return Rewrite::Unchanged;
        }
    };

    match statement {
        Statement::Insert(insert) => match snapshot.table_rule(&insert.table) {
            Some(rule) => rewrite_insert(query, &insert, rule, snapshot),
            None => Rewrite::Unchanged,
        },
        Statement::Update(update) => match snapshot.table_rule(&update.table) {
            Some(rule) => rewrite_update(query, &update, rule, snapshot),
            None => Rewrite::Unchanged,
        },
        Statement::Other => Rewrite::Unchanged,
    }
}

fn convert_literal(
    literal: &ValueLiteral,
    src: &str,
    engine: &Engine,
    ratio: u32,
) -> Option<String> {
    let text = literal.text(src);
    let text = text.strip_prefix('+').unwrap_or(text);
    let source: Decimal = parse_decimal(text)?;
    Some(engine.convert_to_literal(source, ratio))
}

fn rewrite_insert(
    src: &str,
    insert: &InsertStatement,
    rule: &TableRule,
    snapshot: &ConversionSnapshot,
) -> Rewrite {
    // Currency columns in column-list order, skipping any whose shadow
    // column is already listed (the statement is already dual-written).
    let listed: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.name.to_ascii_lowercase())
        .collect();
    let mut currency = Vec::new();
    for (index, column) in insert.columns.iter().enumerate() {
        if let Some(column_rule) = rule.column_rule(&column.name) {
            if listed.contains(&column_rule.target_column.to_ascii_lowercase()) {
                continue;
            }
            currency.push((index, column, column_rule));
        }
    }
    if currency.is_empty() {
        return Rewrite::Unchanged;
    }

    // Convert every currency value up front; any non-numeric literal
    // aborts the rewrite for the whole statement.
    let mut converted_rows = Vec::with_capacity(insert.rows.len());
    for row in &insert.rows {
        if row.values.len() != insert.columns.len() {
            debug!(
                table = %insert.table,
                "value count does not match column count; forwarding unchanged"
            );
            return Rewrite::Unchanged;
        }
        let mut converted = Vec::with_capacity(currency.len());
        for (index, column, column_rule) in &currency {
            let literal = &row.values[*index];
            match literal.kind {
                LiteralKind::Integer | LiteralKind::Float => {
                    let engine = Engine::new(
                        column_rule.effective_mode(snapshot),
                        column_rule.effective_precision(snapshot),
                    );
                    match convert_literal(literal, src, &engine, snapshot.ratio) {
                        Some(value) => converted.push(value),
                        None => {
                            warn!(
                                table = %insert.table,
                                column = %column.name,
                                reason = "unparsable_literal",
                                "skipping dual-write for statement"
                            );
                            return Rewrite::Unchanged;
                        }
                    }
                }
                LiteralKind::Null => {
                    warn!(
                        table = %insert.table,
                        column = %column.name,
                        reason = "null_literal",
                        "skipping dual-write for statement"
                    );
                    return Rewrite::Unchanged;
                }
                LiteralKind::String | LiteralKind::Expr => {
                    warn!(
                        table = %insert.table,
                        column = %column.name,
                        reason = "non_numeric_literal",
                        "skipping dual-write for statement"
                    );
                    return Rewrite::Unchanged;
                }
            }
        }
        converted_rows.push(converted);
    }

    // Splice: extend the column list, then each row tuple, copying every
    // other byte of the original statement.
    let mut out = String::with_capacity(src.len() + 32 * currency.len());
    out.push_str(&src[..insert.columns_close]);
    for (_, _, column_rule) in &currency {
        out.push_str(", ");
        out.push_str(&column_rule.target_column);
    }
    let mut cursor = insert.columns_close;
    for (row, converted) in insert.rows.iter().zip(&converted_rows) {
        out.push_str(&src[cursor..row.close]);
        for value in converted {
            out.push_str(", ");
            out.push_str(value);
        }
        cursor = row.close;
    }
    out.push_str(&src[cursor..]);
    Rewrite::Replaced(out)
}

fn rewrite_update(
    src: &str,
    update: &UpdateStatement,
    rule: &TableRule,
    snapshot: &ConversionSnapshot,
) -> Rewrite {
    let assigned: Vec<String> = update
        .assignments
        .iter()
        .map(|a| a.column.name.to_ascii_lowercase())
        .collect();

    // One appended assignment per currency column with a numeric RHS;
    // non-numeric RHS skips that column but the statement still rewrites
    // for the others.
    let mut appended = Vec::new();
    for assignment in &update.assignments {
        let Some(column_rule) = rule.column_rule(&assignment.column.name) else {
            continue;
        };
        if assigned.contains(&column_rule.target_column.to_ascii_lowercase()) {
            continue;
        }
        match assignment.value.kind {
            LiteralKind::Integer | LiteralKind::Float => {
                let engine = Engine::new(
                    column_rule.effective_mode(snapshot),
                    column_rule.effective_precision(snapshot),
                );
                match convert_literal(&assignment.value, src, &engine, snapshot.ratio) {
                    Some(value) => appended.push((column_rule.target_column.clone(), value)),
                    None => {
                        warn!(
                            table = %update.table,
                            column = %assignment.column.name,
                            reason = "unparsable_literal",
                            "skipping shadow assignment"
                        );
                    }
                }
            }
            LiteralKind::Null => {
                warn!(
                    table = %update.table,
                    column = %assignment.column.name,
                    reason = "null_literal",
                    "skipping shadow assignment"
                );
            }
            LiteralKind::String | LiteralKind::Expr => {
                warn!(
                    table = %update.table,
                    column = %assignment.column.name,
                    reason = "non_numeric_assignment",
                    "skipping shadow assignment"
                );
            }
        }
    }
    if appended.is_empty() {
        return Rewrite::Unchanged;
    }

    let mut out = String::with_capacity(src.len() + 32 * appended.len());
    out.push_str(&src[..update.set_end]);
    for (target, value) in &appended {
        out.push_str(", ");
        out.push_str(target);
        out.push_str(" = ");
        out.push_str(value);
    }
    out.push_str(&src[update.set_end..]);
    Rewrite::Replaced(out)
}
