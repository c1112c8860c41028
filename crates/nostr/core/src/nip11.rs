//! NIP-11 relay information document with a signed P2P extension block.
//!
//! The extension carries the relay's stream peer id and advertised addresses.
//! Its signature is a BIP-340 Schnorr signature by the relay's nostr key over
//! `SHA-256(pack_for_signing(descriptor))`, so a descriptor fetched from the DHT
//! or over HTTP can be attributed to the pubkey it names.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Nip11Error {
    #[error("invalid descriptor JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("descriptor has no p2p extension")]
    MissingExtension,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("descriptor signature does not match its contents")]
    VerificationFailed,
}

pub type Result<T> = std::result::Result<T, Nip11Error>;

/// Public relay metadata as served at the relay's NIP-11 endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub supported_nips: Vec<u32>,
    #[serde(default)]
    pub software: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hornet_extension: Option<P2pExtension>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pExtension {
    pub libp2p_id: String,
    #[serde(default)]
    pub libp2p_addrs: Vec<String>,
    #[serde(default)]
    pub signature: String,
    /// Unix seconds of the last descriptor change.
    #[serde(default)]
    pub last_updated: u64,
}

impl RelayDescriptor {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn last_updated(&self) -> Option<u64> {
        self.hornet_extension.as_ref().map(|ext| ext.last_updated)
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Canonical byte packing of every descriptor field except the signature.
pub fn pack_for_signing(descriptor: &RelayDescriptor) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    put_str(&mut out, &descriptor.name);
    put_str(&mut out, &descriptor.description);
    put_str(&mut out, &descriptor.pubkey);
    put_str(&mut out, &descriptor.contact);
    out.extend_from_slice(&(descriptor.supported_nips.len() as u32).to_be_bytes());
    for nip in &descriptor.supported_nips {
        out.extend_from_slice(&nip.to_be_bytes());
    }
    put_str(&mut out, &descriptor.software);
    put_str(&mut out, &descriptor.version);

    match &descriptor.hornet_extension {
        None => out.push(0x00),
        Some(ext) => {
            out.push(0x01);
            put_str(&mut out, &ext.libp2p_id);
            out.extend_from_slice(&(ext.libp2p_addrs.len() as u32).to_be_bytes());
            for addr in &ext.libp2p_addrs {
                put_str(&mut out, addr);
            }
            out.extend_from_slice(&ext.last_updated.to_be_bytes());
        }
    }
    out
}

fn signing_digest(descriptor: &RelayDescriptor) -> Message {
    let hash = sha256::Hash::hash(&pack_for_signing(descriptor));
    Message::from_digest(hash.to_byte_array())
}

/// Sign the descriptor in place. Sets `pubkey` to the signer's x-only key and
/// creates an empty extension block when none is present.
pub fn sign_descriptor(descriptor: &mut RelayDescriptor, secret_key: &[u8; 32]) -> Result<()> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip11Error::Signing(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = keypair.x_only_public_key();

    descriptor.pubkey = hex::encode(xonly.serialize());
    let message = signing_digest(descriptor);
    let signature = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    descriptor
        .hornet_extension
        .get_or_insert_with(P2pExtension::default)
        .signature = hex::encode(signature.serialize());
    Ok(())
}

/// Check the extension signature against the descriptor's `pubkey`.
pub fn verify_descriptor(descriptor: &RelayDescriptor) -> Result<()> {
    let ext = descriptor
        .hornet_extension
        .as_ref()
        .ok_or(Nip11Error::MissingExtension)?;

    let pubkey_bytes =
        hex::decode(&descriptor.pubkey).map_err(|e| Nip11Error::InvalidPublicKey(e.to_string()))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip11Error::InvalidPublicKey(e.to_string()))?;

    let sig_bytes =
        hex::decode(&ext.signature).map_err(|e| Nip11Error::InvalidSignature(e.to_string()))?;
    let signature = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip11Error::InvalidSignature(e.to_string()))?;

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&signature, &signing_digest(descriptor), &pubkey)
        .map_err(|_| Nip11Error::VerificationFailed)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// JSON encoding with lexicographically sorted object keys, used for
/// publication so equal descriptors always produce equal bytes.
pub fn to_canonical_json(descriptor: &RelayDescriptor) -> Result<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(descriptor)?);
    Ok(serde_json::to_vec(&value)?)
}
