use thiserror::Error;

/// NIP-77 error types
#[derive(Debug, Error)]
pub enum Nip77Error {
    #[error("Invalid protocol version: {0:#04x}")]
    InvalidProtocolVersion(u8),

    #[error("Unsupported protocol version from responder: {0:#04x}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid mode: {0}")]
    InvalidMode(u64),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Varint decode error: {0}")]
    VarintDecode(String),

    #[error("Invalid bound: {0}")]
    InvalidBound(String),

    #[error("Message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Invalid ID length: expected 32, got {0}")]
    InvalidIdLength(usize),

    #[error("Frame size limit must be 0 or at least 4096, got {0}")]
    FrameSizeLimitTooSmall(u64),

    #[error("Storage is already sealed")]
    AlreadySealed,

    #[error("Storage must be sealed before reconciliation")]
    NotSealed,

    #[error("Reconciliation already initiated")]
    AlreadyInitiated,

    #[error("Initiator must reconcile with reconcile_with_ids")]
    InitiatorCannotReconcile,

    #[error("Only the initiator can reconcile with ids")]
    NotInitiator,
}

pub type Result<T> = std::result::Result<T, Nip77Error>;
