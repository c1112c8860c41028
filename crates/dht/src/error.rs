//! DHT error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("DHT operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("DHT put failed: {0}")]
    PutFailed(String),

    #[error("DHT get failed: {0}")]
    GetFailed(String),

    #[error("no value stored at target")]
    NotFound,

    #[error("malformed DHT value: {0}")]
    Malformed(String),

    #[error("stale sequence number: DHT holds {current}, attempted {attempted}")]
    StaleSequence { current: i64, attempted: i64 },

    #[error("signing error: {0}")]
    Signing(String),

    #[error("DHT client unavailable: {0}")]
    Unavailable(String),
}

impl DhtError {
    /// Not-found and malformed responses are expected on a public DHT; callers
    /// log and move on.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidKeyLength(_) | Self::Signing(_))
    }
}

pub type Result<T> = std::result::Result<T, DhtError>;
