use thiserror::Error;

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur at the wire protocol layer
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed packet or payload
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Packet arrived that the current protocol phase cannot accept
    #[error("unexpected packet during {phase}")]
    Unexpected { phase: &'static str },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        ProtocolError::Malformed(msg.into())
    }
}
