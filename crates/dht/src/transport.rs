//! Deadline-bounded BEP44 put/get on top of a [`DhtClient`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::bencode::unbencode_bytes;
use crate::client::{DhtClient, MutableItem};
use crate::error::{DhtError, Result};
use crate::keys::Target;

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// What a value builder hands back for one put attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutValue {
    /// Item value as stored in `v`; usually `bencode_bytes(payload)`.
    pub value: Vec<u8>,
    pub seq: i64,
    /// Signature over `signing_input(salt, seq, value)` by the item key.
    pub signature: [u8; 64],
}

#[derive(Clone)]
pub struct Bep44Transport {
    client: Arc<dyn DhtClient>,
    max_wait: Duration,
}

impl Bep44Transport {
    pub fn new(client: Arc<dyn DhtClient>, max_wait: Duration) -> Self {
        Self { client, max_wait }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        timeout(self.max_wait, operation)
            .await
            .map_err(|_| DhtError::TimedOut(self.max_wait))?
    }

    /// Publish a mutable item at `target`.
    ///
    /// The current item is read first; `build` receives the next sequence
    /// number (current + 1, or 1 when nothing is stored) and may return a
    /// different one, as long as it does not go below the stored sequence.
    pub async fn put<F>(
        &self,
        target: Target,
        key: &[u8; 32],
        salt: &[u8],
        build: F,
    ) -> Result<Target>
    where
        F: FnOnce(i64) -> Result<PutValue>,
    {
        let current = self
            .bounded(self.client.get_mutable(key, salt))
            .await?
            .map(|item| item.seq);
        let proposed = current.map_or(1, |seq| seq.saturating_add(1));

        let built = build(proposed)?;
        if let Some(current) = current
            && built.seq < current
        {
            return Err(DhtError::StaleSequence {
                current,
                attempted: built.seq,
            });
        }

        let item = MutableItem {
            key: *key,
            salt: salt.to_vec(),
            seq: built.seq,
            value: built.value,
            signature: built.signature,
        };
        if item.target() != target {
            return Err(DhtError::PutFailed(format!(
                "item key and salt address {} but target is {}",
                item.target(),
                target
            )));
        }

        let stored = self.bounded(self.client.put_mutable(item)).await?;
        debug!(item_target = %stored, seq = built.seq, "BEP44 put complete");
        Ok(stored)
    }

    /// Fetch the payload stored under `(key, salt)`, unwrapping the bencoded
    /// byte string held in the item value.
    pub async fn get(&self, key: &[u8; 32], salt: &[u8]) -> Result<Vec<u8>> {
        let item = self.get_item(key, salt).await?;
        unbencode_bytes(&item.value).map(<[u8]>::to_vec)
    }

    pub async fn get_item(&self, key: &[u8; 32], salt: &[u8]) -> Result<MutableItem> {
        let item = self
            .bounded(self.client.get_mutable(key, salt))
            .await?
            .ok_or(DhtError::NotFound)?;
        if !item.has_valid_signature() {
            warn!(key = %hex::encode(key), "dropping DHT item with invalid signature");
            return Err(DhtError::Malformed("invalid item signature".to_string()));
        }
        Ok(item)
    }

    pub async fn put_immutable(&self, value: &[u8]) -> Result<Target> {
        self.bounded(self.client.put_immutable(value)).await
    }

    pub async fn get_immutable(&self, target: Target) -> Result<Vec<u8>> {
        self.bounded(self.client.get_immutable(target))
            .await?
            .ok_or(DhtError::NotFound)
    }
}
