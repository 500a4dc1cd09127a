//! Client error types

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(usize),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ClientError {
    /// Worth another connect attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Closed)
    }
}
