//! NIP-01: event structure, canonical serialization, id hashing and Schnorr signing.
//!
//! The relay stores and exchanges events in this shape. Events received from
//! peers are always passed through [`verify_event`] before they are stored.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tag_parsing::{collect_tag_values, find_tag_value};

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex sha256 of the serialized event
    pub id: String,
    /// 32-byte lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// 64-byte lowercase hex Schnorr signature over `id`
    pub sig: String,
}

impl Event {
    /// Decoded event id. Fails when `id` is not 32 bytes of hex.
    pub fn id_bytes(&self) -> Result<[u8; 32], Nip01Error> {
        decode_hex32(&self.id)
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        find_tag_value(&self.tags, name)
    }

    /// First values of every tag named `name`, in tag order.
    pub fn tag_values(&self, name: &str) -> Vec<String> {
        collect_tag_values(&self.tags, name)
    }

    fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

/// An event before its id and signature are computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Event fields supplied by the caller; the pubkey comes from the signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_RELAY_LIST: u16 = 10002;

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// X-only public key for a secp256k1 secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Serialize an unsigned event for hashing: `[0, pubkey, created_at, kind, tags, content]`.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Hex event id of an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

/// Structural check of a signed event. Does not verify the signature.
pub fn validate_event(event: &Event) -> bool {
    is_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_hex(&event.sig, 128)
}

/// Sign a template, producing a complete event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let (xonly_pk, _parity) = sk.x_only_public_key(&secp);

    let unsigned = UnsignedEvent {
        pubkey: hex::encode(xonly_pk.serialize()),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let id = get_event_hash(&unsigned)?;

    let message = Message::from_digest(decode_hex32(&id)?);
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify an event's id and signature.
///
/// Returns `Ok(false)` for well-formed events whose id or signature does not
/// match, and an error only when a field cannot be decoded at all.
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !validate_event(event) {
        return Ok(false);
    }

    if get_event_hash(&event.unsigned())? != event.id {
        return Ok(false);
    }

    let message = Message::from_digest(decode_hex32(&event.id)?);
    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| Nip01Error::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid signature: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&decode_hex32(&event.pubkey)?)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey: {}", e)))?;

    let secp = Secp256k1::verification_only();
    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}

fn decode_hex32(value: &str) -> Result<[u8; 32], Nip01Error> {
    let bytes = hex::decode(value).map_err(|e| Nip01Error::InvalidHex(e.to_string()))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        Nip01Error::InvalidHex(format!("expected 32 bytes, got {}", bytes.len()))
    })
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    is_hex(value, len) && !value.chars().any(|c| c.is_ascii_uppercase())
}
