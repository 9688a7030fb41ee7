//! Database access for the backfill engine.
//!
//! The worker is written against [`BackfillStore`] so the batch loop can
//! be exercised without a server; [`MySqlStore`] is the production
//! implementation over a `sqlx` MySQL pool. Table and column names are
//! interpolated into SQL and therefore validated as plain identifiers
//! before use.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Row;

use quotient_shared::exception::{QuotientError, QuotientResult};

/// One row still missing its shadow value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRow {
    pub id: i64,
    pub value: i64,
}

#[async_trait]
pub trait BackfillStore: Send + Sync {
    /// `SELECT COUNT(*) FROM <table> WHERE <target> IS NULL`
    async fn count_pending(&self, table: &str, target: &str) -> QuotientResult<u64>;

    /// Next batch of unmigrated rows in id order. `after_id` is the keyset
    /// cursor: rows at or below it are skipped, so rows whose migration
    /// permanently failed do not stall the scan.
    async fn fetch_batch(
        &self,
        table: &str,
        id_column: &str,
        source: &str,
        target: &str,
        after_id: Option<i64>,
        limit: u32,
    ) -> QuotientResult<Vec<PendingRow>>;

    /// Write one converted value: `UPDATE <table> SET <target> = ? WHERE <id_column> = ?`.
    async fn write_shadow(
        &self,
        table: &str,
        id_column: &str,
        target: &str,
        id: i64,
        value: &str,
    ) -> QuotientResult<()>;
}

/// Reject anything that is not a bare SQL identifier. Names are spliced
/// into statements, so this is load-bearing, not cosmetic.
pub(crate) fn validate_identifier(name: &str) -> QuotientResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        Ok(())
    } else {
        Err(QuotientError::invalid_config(format!(
            "invalid identifier: {name:?}"
        )))
    }
}

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(database_url: &str) -> QuotientResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| QuotientError::database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackfillStore for MySqlStore {
    async fn count_pending(&self, table: &str, target: &str) -> QuotientResult<u64> {
        validate_identifier(table)?;
        validate_identifier(target)?;
        let sql = format!("SELECT COUNT(*) FROM `{table}` WHERE `{target}` IS NULL");
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QuotientError::database(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_batch(
        &self,
        table: &str,
        id_column: &str,
        source: &str,
        target: &str,
        after_id: Option<i64>,
        limit: u32,
    ) -> QuotientResult<Vec<PendingRow>> {
        validate_identifier(table)?;
        validate_identifier(id_column)?;
        validate_identifier(source)?;
        validate_identifier(target)?;
        let sql = match after_id {
            Some(_) => format!(
                "SELECT `{id_column}`, `{source}` FROM `{table}` \
                 WHERE `{target}` IS NULL AND `{id_column}` > ? \
                 ORDER BY `{id_column}` LIMIT ?"
            ),
            None => format!(
                "SELECT `{id_column}`, `{source}` FROM `{table}` \
                 WHERE `{target}` IS NULL ORDER BY `{id_column}` LIMIT ?"
            ),
        };
        let mut query = sqlx::query(&sql);
        if let Some(after_id) = after_id {
            query = query.bind(after_id);
        }
        let rows = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QuotientError::database(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let id: i64 = row
                    .try_get(0)
                    .map_err(|e| QuotientError::database(e.to_string()))?;
                let value: i64 = row
                    .try_get(1)
                    .map_err(|e| QuotientError::database(e.to_string()))?;
                Ok(PendingRow { id, value })
            })
            .collect()
    }

    async fn write_shadow(
        &self,
        table: &str,
        id_column: &str,
        target: &str,
        id: i64,
        value: &str,
    ) -> QuotientResult<()> {
        validate_identifier(table)?;
        validate_identifier(id_column)?;
        validate_identifier(target)?;
        let sql = format!("UPDATE `{table}` SET `{target}` = ? WHERE `{id_column}` = ?");
        sqlx::query(&sql)
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| QuotientError::database(e.to_string()))?;
        Ok(())
    }
}
