//! The DHT client port and an in-process implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{DhtError, Result};
use crate::keys::{Target, immutable_target, mutable_target};
use crate::signing::{signing_input, verify_ed25519, verify_schnorr};

/// A signed BEP44 mutable item as stored in the DHT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableItem {
    pub key: [u8; 32],
    pub salt: Vec<u8>,
    pub seq: i64,
    /// Raw `v` contents. Values published here are themselves bencoded byte strings.
    pub value: Vec<u8>,
    pub signature: [u8; 64],
}

impl MutableItem {
    pub fn target(&self) -> Target {
        mutable_target(&self.key, &self.salt)
    }

    pub fn signing_input(&self) -> Vec<u8> {
        signing_input(&self.salt, self.seq, &self.value)
    }

    /// True when the signature verifies under either publication scheme.
    pub fn has_valid_signature(&self) -> bool {
        let input = self.signing_input();
        verify_ed25519(&self.key, &input, &self.signature)
            || verify_schnorr(&self.key, &input, &self.signature)
    }
}

/// Minimal BEP44 surface the relay needs from a DHT node.
#[async_trait]
pub trait DhtClient: Send + Sync {
    async fn put_mutable(&self, item: MutableItem) -> Result<Target>;

    /// Most recent item for `(key, salt)`, if any node returned one.
    async fn get_mutable(&self, key: &[u8; 32], salt: &[u8]) -> Result<Option<MutableItem>>;

    async fn put_immutable(&self, value: &[u8]) -> Result<Target>;

    async fn get_immutable(&self, target: Target) -> Result<Option<Vec<u8>>>;
}

/// DHT held in process memory. Applies the same acceptance rules a storing
/// node would: valid signature, and no sequence number regression.
#[derive(Default)]
pub struct MemoryDht {
    inner: Mutex<MemoryDhtInner>,
}

#[derive(Default)]
struct MemoryDhtInner {
    mutable: HashMap<Target, MutableItem>,
    immutable: HashMap<Target, Vec<u8>>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn item_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.mutable.len() + inner.immutable.len()
    }
}

#[async_trait]
impl DhtClient for MemoryDht {
    async fn put_mutable(&self, item: MutableItem) -> Result<Target> {
        if !item.has_valid_signature() {
            return Err(DhtError::PutFailed("invalid signature".to_string()));
        }

        let target = item.target();
        let mut inner = self.inner.lock().await;
        if let Some(current) = inner.mutable.get(&target)
            && current.seq > item.seq
        {
            return Err(DhtError::StaleSequence {
                current: current.seq,
                attempted: item.seq,
            });
        }
        inner.mutable.insert(target, item);
        Ok(target)
    }

    async fn get_mutable(&self, key: &[u8; 32], salt: &[u8]) -> Result<Option<MutableItem>> {
        let target = mutable_target(key, salt);
        Ok(self.inner.lock().await.mutable.get(&target).cloned())
    }

    async fn put_immutable(&self, value: &[u8]) -> Result<Target> {
        let target = immutable_target(value);
        self.inner
            .lock()
            .await
            .immutable
            .insert(target, value.to_vec());
        Ok(target)
    }

    async fn get_immutable(&self, target: Target) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.immutable.get(&target).cloned())
    }
}
