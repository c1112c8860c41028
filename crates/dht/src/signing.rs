//! BEP44 signing input and the two signature schemes used to publish.
//!
//! Mainline nodes verify ed25519 signatures, so descriptors meant for the
//! public DHT go through [`sign_ed25519`]. [`sign_schnorr`] signs the same
//! input with the relay's nostr key for consumers that attribute the item to a
//! nostr identity.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::bencode::bencode_bytes;
use crate::error::{DhtError, Result};

/// Bytes a mutable item signature covers:
/// `4:salt<len>:<salt>` (only when salt is non-empty), `3:seqi<seq>e1:v`,
/// then the bencoded item value.
pub fn signing_input(salt: &[u8], seq: i64, value: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(32 + salt.len() + value.len());
    if !salt.is_empty() {
        input.extend_from_slice(b"4:salt");
        input.extend_from_slice(&bencode_bytes(salt));
    }
    input.extend_from_slice(format!("3:seqi{}e1:v", seq).as_bytes());
    input.extend_from_slice(&bencode_bytes(value));
    input
}

pub fn ed25519_public_key(seed: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(seed).verifying_key().to_bytes()
}

pub fn sign_ed25519(seed: &[u8; 32], input: &[u8]) -> [u8; 64] {
    SigningKey::from_bytes(seed).sign(input).to_bytes()
}

pub fn verify_ed25519(public_key: &[u8; 32], input: &[u8], signature: &[u8; 64]) -> bool {
    VerifyingKey::from_bytes(public_key)
        .map(|key| key.verify_strict(input, &Signature::from_bytes(signature)).is_ok())
        .unwrap_or(false)
}

fn digest(input: &[u8]) -> Message {
    Message::from_digest(sha256::Hash::hash(input).to_byte_array())
}

/// BIP-340 Schnorr signature over `SHA-256(input)`.
pub fn sign_schnorr(secret_key: &[u8; 32], input: &[u8]) -> Result<[u8; 64]> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| DhtError::Signing(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    Ok(secp.sign_schnorr_no_aux_rand(&digest(input), &keypair).serialize())
}

pub fn schnorr_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32]> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| DhtError::Signing(e.to_string()))?;
    Ok(sk.x_only_public_key(&secp).0.serialize())
}

pub fn verify_schnorr(public_key: &[u8; 32], input: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = XOnlyPublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(signature) = schnorr::Signature::from_slice(signature) else {
        return false;
    };
    Secp256k1::verification_only()
        .verify_schnorr(&signature, &digest(input), &key)
        .is_ok()
}
