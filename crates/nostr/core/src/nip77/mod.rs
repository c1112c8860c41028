//! NIP-77: Negentropy Syncing
//!
//! Range-Based Set Reconciliation (RBSR) over `(created_at, id)` items. Two
//! peers exchange fingerprints of sorted ranges and recursively split the ranges
//! whose fingerprints differ, until the differing ranges are small enough to
//! send as plain id lists. Identical sets converge in a single round trip.
//!
//! Internal module boundaries:
//! - `error`: shared protocol error and result types
//! - `codec`: varint primitives and the message reader
//! - `model`: bounds, modes, records and fingerprints
//! - `storage`: the sealed item vector the engine reads from
//! - `reconciliation`: the stateful engine
//!
//! # Protocol Flow
//!
//! ```text
//! Initiator                               Responder
//!   |                                       |
//!   |  initiate() ----------------------→  |
//!   |                                       | reconcile()
//!   | ←---------------------- ranges/fps   |
//!   | reconcile_with_ids()                  |
//!   |   (have/need ids for this round)      |
//!   |  refined ranges ------------------→  |
//!   |  ...until reconcile_with_ids         |
//!   |     returns an empty message...       |
//! ```
//!
//! Messages are bounded by a frame size limit. Larger differences take more
//! rounds; the engine hands unfinished ranges back as a trailing fingerprint.
//!
//! # References
//!
//! - NIP-77: <https://github.com/nostr-protocol/nips/blob/master/77.md>
//! - Negentropy Protocol: <https://github.com/hoytech/negentropy>

mod codec;
mod error;
mod model;
mod reconciliation;
mod storage;

pub use codec::{decode_varint, encode_varint};
pub use error::{Nip77Error, Result};
pub use model::{
    Bound, EventId, FINGERPRINT_SIZE, ID_SIZE, PROTOCOL_VERSION_1, RangeMode, Record,
    TIMESTAMP_INFINITY, calculate_fingerprint, sort_records,
};
pub use reconciliation::{MIN_FRAME_SIZE_LIMIT, Negentropy, ReconcileOutput};
pub use storage::NegentropyStorage;

#[cfg(test)]
mod tests;
