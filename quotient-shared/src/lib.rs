//! Shared core for the Quotient dual-write proxy.
//!
//! This crate holds the pieces every other crate leans on: the error
//! taxonomy, the decimal rounding engine, the hot-reloadable configuration
//! store, and the metrics collector trait.

pub mod config;
pub mod exception;
pub mod metrics;
pub mod rounding;

pub use config::{ColumnRule, ConfigStore, ConversionSnapshot, ProxyConfig, TableRule};
pub use exception::{QuotientError, QuotientResult};
pub use metrics::{MetricsSink, NoopSink, QueryOp};
pub use rounding::{Engine, RoundingMode};
