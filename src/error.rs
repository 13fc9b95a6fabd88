use thiserror::Error;

use crate::presence::ConnectionId;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("message log I/O failed: {0}")]
    Storage(#[from] std::io::Error),
    #[error("message log entry could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("failed to bind listener: {0}")]
    Bind(#[from] warp::Error),
}

impl ChatError {
    /// Stable tag sent to clients in `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Protocol(_) => "protocol",
            ChatError::DuplicateConnection(_) => "duplicate_connection",
            ChatError::Storage(_) | ChatError::Codec(_) | ChatError::Bind(_) => "internal",
        }
    }
}
