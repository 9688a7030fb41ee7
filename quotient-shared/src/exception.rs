use thiserror::Error;

/// Quotient-specific error types
#[derive(Debug, Error)]
pub enum QuotientError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("backfill already running for {job}")]
    AlreadyRunning { job: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {operation}")]
    Timeout { operation: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QuotientError {
    pub fn invalid_config<S: Into<String>>(reason: S) -> Self {
        QuotientError::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn backend_unavailable<S: Into<String>>(reason: S) -> Self {
        QuotientError::BackendUnavailable {
            reason: reason.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        QuotientError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn database<S: Into<String>>(msg: S) -> Self {
        QuotientError::Database(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        QuotientError::Internal(msg.into())
    }
}

/// Result type for Quotient operations
pub type QuotientResult<T> = Result<T, QuotientError>;
