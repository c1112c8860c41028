//! The relay's own key material and the records published under it.
//!
//! One 32-byte secret serves two roles: it is the secp256k1 key that signs
//! the descriptor (and names the relay to nostr clients), and the ed25519
//! seed whose public key addresses the descriptor in the DHT.

use nostr::nip11::{sign_descriptor, to_canonical_json};
use nostr::{Nip01Error, Nip11Error, P2pExtension, RelayDescriptor, get_public_key_hex};
use openagents_dht::bencode_bytes;
use openagents_dht::signing::{ed25519_public_key, sign_ed25519, signing_input};
use openagents_dht::{DhtError, derive_dht_key, derive_dht_key_for_public_key};
use thiserror::Error;

use crate::config::Config;
use crate::store::DhtUploadable;

pub const SOFTWARE: &str = "openagents-relay";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid relay key: {0}")]
    Key(#[from] Nip01Error),
    #[error("descriptor error: {0}")]
    Descriptor(#[from] Nip11Error),
    #[error("DHT key error: {0}")]
    Dht(#[from] DhtError),
    #[error("descriptor has no last_updated timestamp")]
    MissingTimestamp,
    #[error("last_updated {0} does not fit a sequence number")]
    SequenceOverflow(u64),
}

#[derive(Clone)]
pub struct RelayIdentity {
    secret_key: [u8; 32],
    pubkey: String,
    dht_public_key: [u8; 32],
}

impl RelayIdentity {
    pub fn from_secret(secret_key: [u8; 32]) -> Result<Self, IdentityError> {
        Ok(Self {
            pubkey: get_public_key_hex(&secret_key)?,
            dht_public_key: ed25519_public_key(&secret_key),
            secret_key,
        })
    }

    /// Nostr x-only public key, hex.
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }

    /// Key the descriptor is published under; peers list this in their
    /// bootstrap keys.
    pub fn dht_public_key(&self) -> [u8; 32] {
        self.dht_public_key
    }

    /// Lookup handle derived from the clamped secret key.
    pub fn dht_key(&self) -> Result<String, IdentityError> {
        Ok(derive_dht_key(&self.secret_key)?)
    }

    pub fn dht_key_for_public_key(&self) -> String {
        derive_dht_key_for_public_key(&self.dht_public_key)
    }

    /// Signed descriptor advertising `config.public_addrs`, stamped `now`.
    pub fn descriptor(&self, config: &Config, now: u64) -> Result<RelayDescriptor, IdentityError> {
        let mut descriptor = RelayDescriptor {
            name: config.name.clone(),
            description: config.description.clone(),
            pubkey: self.pubkey.clone(),
            contact: config.contact.clone(),
            supported_nips: config.supported_nips.clone(),
            software: SOFTWARE.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hornet_extension: Some(P2pExtension {
                libp2p_id: hex::encode(self.dht_public_key),
                libp2p_addrs: config.public_addrs.clone(),
                signature: String::new(),
                last_updated: now,
            }),
        };
        sign_descriptor(&mut descriptor, &self.secret_key)?;
        Ok(descriptor)
    }

    /// DHT publication of `descriptor`: canonical JSON payload, sequence
    /// number taken from `last_updated`, ed25519 signature over the BEP44
    /// signing input with an empty salt.
    pub fn uploadable(&self, descriptor: &RelayDescriptor) -> Result<DhtUploadable, IdentityError> {
        let last_updated = descriptor
            .last_updated()
            .ok_or(IdentityError::MissingTimestamp)?;
        let seq =
            i64::try_from(last_updated).map_err(|_| IdentityError::SequenceOverflow(last_updated))?;
        let payload = to_canonical_json(descriptor)?;
        let signature = sign_ed25519(
            &self.secret_key,
            &signing_input(b"", seq, &bencode_bytes(&payload)),
        );
        Ok(DhtUploadable {
            pubkey: self.dht_public_key,
            payload,
            signature,
            seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use nostr::nip11::verify_descriptor;
    use openagents_dht::MutableItem;

    use super::*;

    const SECRET: [u8; 32] = [0x11; 32];

    fn config() -> Config {
        let values = HashMap::from([
            ("RELAY_NAME", "alpha"),
            ("RELAY_PUBLIC_ADDRS", "/ip4/10.0.0.1/tcp/9736"),
        ]);
        Config::from_lookup(|key| values.get(key).map(ToString::to_string)).unwrap()
    }

    #[test]
    fn descriptor_is_signed_by_the_nostr_key() {
        let identity = RelayIdentity::from_secret(SECRET).unwrap();
        let descriptor = identity.descriptor(&config(), 1_700_000_000).unwrap();

        assert_eq!(descriptor.pubkey, identity.pubkey());
        assert_eq!(descriptor.name, "alpha");
        assert_eq!(descriptor.software, SOFTWARE);
        let ext = descriptor.hornet_extension.as_ref().unwrap();
        assert_eq!(ext.libp2p_id, hex::encode(identity.dht_public_key()));
        assert_eq!(ext.libp2p_addrs, vec!["/ip4/10.0.0.1/tcp/9736".to_string()]);
        verify_descriptor(&descriptor).unwrap();
    }

    #[test]
    fn uploadable_verifies_as_a_dht_item() {
        let identity = RelayIdentity::from_secret(SECRET).unwrap();
        let descriptor = identity.descriptor(&config(), 1_700_000_000).unwrap();
        let uploadable = identity.uploadable(&descriptor).unwrap();

        assert_eq!(uploadable.seq, 1_700_000_000);
        assert_eq!(uploadable.pubkey, identity.dht_public_key());
        assert_eq!(
            RelayDescriptor::from_json(&uploadable.payload).unwrap(),
            descriptor
        );

        let item = MutableItem {
            key: uploadable.pubkey,
            salt: Vec::new(),
            seq: uploadable.seq,
            value: bencode_bytes(&uploadable.payload),
            signature: uploadable.signature,
        };
        assert!(item.has_valid_signature());
    }

    #[test]
    fn dht_keys_are_stable() {
        let identity = RelayIdentity::from_secret(SECRET).unwrap();
        assert_eq!(identity.dht_key().unwrap(), derive_dht_key(&SECRET).unwrap());
        assert_eq!(identity.dht_key().unwrap().len(), 40);
        assert_ne!(identity.dht_key().unwrap(), identity.dht_key_for_public_key());
    }

    #[test]
    fn descriptor_without_timestamp_cannot_be_uploaded() {
        let identity = RelayIdentity::from_secret(SECRET).unwrap();
        let descriptor = RelayDescriptor::default();
        assert!(matches!(
            identity.uploadable(&descriptor),
            Err(IdentityError::MissingTimestamp)
        ));
    }
}
