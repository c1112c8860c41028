//! Pure derivations from key material to DHT handles and BEP44 targets.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::bencode::bencode_bytes;
use crate::error::{DhtError, Result};

/// A 20-byte DHT address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target(pub [u8; 20]);

impl Target {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.to_hex())
    }
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Lowercase hex SHA-1 of the ed25519-clamped secret key.
///
/// The clamping matches the ed25519 scalar convention so the handle lines up
/// with the ed25519 publication path; it must stay bit-for-bit stable.
pub fn derive_dht_key(secret_key: &[u8]) -> Result<String> {
    let mut clamped: [u8; 32] = secret_key
        .try_into()
        .map_err(|_| DhtError::InvalidKeyLength(secret_key.len()))?;
    clamped[0] &= 0xF8;
    clamped[31] &= 0x7F;
    clamped[31] |= 0x40;
    Ok(hex::encode(sha1(&[&clamped])))
}

/// Lowercase hex SHA-1 of the raw public key bytes.
pub fn derive_dht_key_for_public_key(public_key: &[u8]) -> String {
    hex::encode(sha1(&[public_key]))
}

/// BEP44 mutable item target: `SHA1(public_key || salt)`.
pub fn mutable_target(public_key: &[u8], salt: &[u8]) -> Target {
    Target(sha1(&[public_key, salt]))
}

/// BEP44 immutable item target: SHA-1 of the bencoded value.
pub fn immutable_target(value: &[u8]) -> Target {
    Target(sha1(&[&bencode_bytes(value)]))
}
