//! Configuration model for the proxy and the rewrite rules.
//!
//! The conversion snapshot is the unit of hot reload: an immutable value
//! describing which tables/columns are dual-written and how values are
//! converted. The runtime [`ProxyConfig`] wraps a snapshot with listener,
//! pool, breaker and backfill settings loaded from the YAML config file.

mod file;
mod store;

pub use file::{
    BackendSettings, BackfillSettings, BreakerSettings, ConversionSettings, ListenerSettings,
    LoggingSettings, ProxyConfig,
};
pub use store::ConfigStore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::exception::{QuotientError, QuotientResult};
use crate::rounding::{RoundingMode, MAX_PRECISION};

/// Immutable rewrite configuration, shared as `Arc<ConversionSnapshot>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionSnapshot {
    /// Divisor applied during conversion (e.g. 1000 for a 1000:1 redenomination).
    pub ratio: u32,
    /// Fractional digits retained after rounding, 0..=10.
    pub precision: u32,
    pub rounding_mode: RoundingMode,
    #[serde(default)]
    pub tables: HashMap<String, TableRule>,
}

/// Per-table rewrite rule, keyed by source column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRule {
    pub enabled: bool,
    #[serde(default)]
    pub columns: HashMap<String, ColumnRule>,
}

/// Per-column rewrite rule. The source column is the map key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRule {
    pub target_column: String,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub rounding_mode: Option<RoundingMode>,
}

impl ConversionSnapshot {
    /// Look up the rule for a table, case-insensitively. Disabled tables
    /// resolve to `None`.
    pub fn table_rule(&self, table: &str) -> Option<&TableRule> {
        self.tables
            .get(&table.to_ascii_lowercase())
            .filter(|rule| rule.enabled)
    }

    pub fn validate(&self) -> QuotientResult<()> {
        if self.ratio == 0 {
            return Err(QuotientError::invalid_config("ratio must be positive"));
        }
        if self.precision > MAX_PRECISION {
            return Err(QuotientError::invalid_config(format!(
                "precision {} exceeds maximum {}",
                self.precision, MAX_PRECISION
            )));
        }
        for (table, rule) in &self.tables {
            let mut targets = std::collections::HashSet::new();
            for (column, column_rule) in &rule.columns {
                if column_rule.target_column.is_empty() {
                    return Err(QuotientError::invalid_config(format!(
                        "table {table}: column {column} has an empty target column"
                    )));
                }
                if let Some(precision) = column_rule.precision {
                    if precision > MAX_PRECISION {
                        return Err(QuotientError::invalid_config(format!(
                            "table {table}: column {column} precision {precision} exceeds maximum {MAX_PRECISION}"
                        )));
                    }
                }
                if !targets.insert(column_rule.target_column.to_ascii_lowercase()) {
                    return Err(QuotientError::invalid_config(format!(
                        "table {table}: duplicate target column {}",
                        column_rule.target_column
                    )));
                }
            }
        }
        Ok(())
    }

    /// Lowercase all table and column keys so lookups are case-insensitive.
    pub fn normalized(mut self) -> Self {
        self.tables = std::mem::take(&mut self.tables)
            .into_iter()
            .map(|(table, mut rule)| {
                rule.columns = std::mem::take(&mut rule.columns)
                    .into_iter()
                    .map(|(column, column_rule)| (column.to_ascii_lowercase(), column_rule))
                    .collect();
                (table.to_ascii_lowercase(), rule)
            })
            .collect();
        self
    }
}

impl TableRule {
    /// Look up a column rule, case-insensitively.
    pub fn column_rule(&self, column: &str) -> Option<&ColumnRule> {
        self.columns.get(&column.to_ascii_lowercase())
    }
}

impl ColumnRule {
    pub fn effective_precision(&self, snapshot: &ConversionSnapshot) -> u32 {
        self.precision.unwrap_or(snapshot.precision)
    }

    pub fn effective_mode(&self, snapshot: &ConversionSnapshot) -> RoundingMode {
        self.rounding_mode.unwrap_or(snapshot.rounding_mode)
    }
}
