//! BEP44 publication and discovery of relay descriptors over the Mainline DHT.
//!
//! - `keys`: DHT key handles and BEP44 targets derived from key material
//! - `signing`: the canonical mutable-item signing input, ed25519 and Schnorr signers
//! - `transport`: put/get with a deadline and sequence-number checks
//! - `client`: the [`DhtClient`] port, plus [`MemoryDht`]
//! - `mainline_dht`: [`MainlineDht`], the public network backend

pub mod bencode;
pub mod client;
pub mod error;
pub mod keys;
pub mod mainline_dht;
pub mod signing;
pub mod transport;

pub use bencode::{bencode_bytes, unbencode_bytes};
pub use client::{DhtClient, MemoryDht, MutableItem};
pub use error::{DhtError, Result};
pub use keys::{
    Target, derive_dht_key, derive_dht_key_for_public_key, immutable_target, mutable_target,
};
pub use mainline_dht::MainlineDht;
pub use transport::{Bep44Transport, DEFAULT_MAX_WAIT, PutValue};
