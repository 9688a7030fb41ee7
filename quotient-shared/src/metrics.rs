//! Metrics collector trait.
//!
//! The core only emits typed events; how they are exposed (Prometheus or
//! otherwise) is the sink implementation's concern. Components receive an
//! `Arc<dyn MetricsSink>` at construction; there is no process-global
//! registry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Statement classification used for the query duration histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOp {
    Insert,
    Update,
    Select,
    Other,
}

impl QueryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryOp::Insert => "insert",
            QueryOp::Update => "update",
            QueryOp::Select => "select",
            QueryOp::Other => "other",
        }
    }

    /// Classify a statement by its leading keyword.
    pub fn classify(query: &str) -> Self {
        let trimmed = query.trim_start();
        let keyword: String = trimmed
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        if keyword.eq_ignore_ascii_case("insert") {
            QueryOp::Insert
        } else if keyword.eq_ignore_ascii_case("update") {
            QueryOp::Update
        } else if keyword.eq_ignore_ascii_case("select") {
            QueryOp::Select
        } else {
            QueryOp::Other
        }
    }
}

/// Error classification for the error counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Protocol,
    Backend,
    Parse,
    TypeMismatch,
    Config,
    Database,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Backend => "backend",
            ErrorKind::Parse => "parse",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::Config => "config",
            ErrorKind::Database => "database",
        }
    }
}

/// Sink for the counter/gauge/histogram events the core emits.
pub trait MetricsSink: Send + Sync {
    /// Dual-write outcome counter (success / error).
    fn record_dual_write(&self, success: bool);
    /// Query duration histogram keyed by operation.
    fn record_query_duration(&self, op: QueryOp, duration: Duration);
    /// Active backend connection gauge.
    fn set_backend_connections(&self, active: usize);
    /// Error counter keyed by error kind.
    fn record_error(&self, kind: ErrorKind);
    /// Circuit breaker state gauge: 0=Closed, 1=Open, 2=HalfOpen.
    fn set_circuit_state(&self, state: u8);
    /// Backfill progress gauge per table, 0-100.
    fn set_backfill_progress(&self, table: &str, percentage: f64);
    /// Backfill rows-processed counter per table.
    fn record_backfill_rows(&self, table: &str, rows: u64);
    /// Backfill error counter per table.
    fn record_backfill_error(&self, table: &str);
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_dual_write(&self, _success: bool) {}
    fn record_query_duration(&self, _op: QueryOp, _duration: Duration) {}
    fn set_backend_connections(&self, _active: usize) {}
    fn record_error(&self, _kind: ErrorKind) {}
    fn set_circuit_state(&self, _state: u8) {}
    fn set_backfill_progress(&self, _table: &str, _percentage: f64) {}
    fn record_backfill_rows(&self, _table: &str, _rows: u64) {}
    fn record_backfill_error(&self, _table: &str) {}
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub dual_write_success: u64,
    pub dual_write_error: u64,
    pub query_durations: Vec<(QueryOp, Duration)>,
    pub backend_connections: Option<usize>,
    pub errors: HashMap<ErrorKind, u64>,
    pub circuit_state: Option<u8>,
    pub backfill_progress: HashMap<String, f64>,
    pub backfill_rows: HashMap<String, u64>,
    pub backfill_errors: HashMap<String, u64>,
}

impl RecordingSink {
    pub fn snapshot(&self) -> Recorded {
        self.inner.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MetricsSink for RecordingSink {
    fn record_dual_write(&self, success: bool) {
        if let Ok(mut r) = self.inner.lock() {
            if success {
                r.dual_write_success += 1;
            } else {
                r.dual_write_error += 1;
            }
        }
    }

    fn record_query_duration(&self, op: QueryOp, duration: Duration) {
        if let Ok(mut r) = self.inner.lock() {
            r.query_durations.push((op, duration));
        }
    }

    fn set_backend_connections(&self, active: usize) {
        if let Ok(mut r) = self.inner.lock() {
            r.backend_connections = Some(active);
        }
    }

    fn record_error(&self, kind: ErrorKind) {
        if let Ok(mut r) = self.inner.lock() {
            *r.errors.entry(kind).or_default() += 1;
        }
    }

    fn set_circuit_state(&self, state: u8) {
        if let Ok(mut r) = self.inner.lock() {
            r.circuit_state = Some(state);
        }
    }

    fn set_backfill_progress(&self, table: &str, percentage: f64) {
        if let Ok(mut r) = self.inner.lock() {
            r.backfill_progress.insert(table.to_string(), percentage);
        }
    }

    fn record_backfill_rows(&self, table: &str, rows: u64) {
        if let Ok(mut r) = self.inner.lock() {
            *r.backfill_rows.entry(table.to_string()).or_default() += rows;
        }
    }

    fn record_backfill_error(&self, table: &str) {
        if let Ok(mut r) = self.inner.lock() {
            *r.backfill_errors.entry(table.to_string()).or_default() += 1;
        }
    }
}
