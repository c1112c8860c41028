//! [`DhtClient`] over the public BitTorrent Mainline DHT.

use async_trait::async_trait;
use mainline::async_dht::AsyncDht;
use mainline::{Dht, Id};
use tracing::debug;

use crate::client::{DhtClient, MutableItem};
use crate::error::{DhtError, Result};
use crate::keys::Target;

pub struct MainlineDht {
    dht: AsyncDht,
}

impl MainlineDht {
    /// Join the DHT as a client node using the default bootstrap nodes.
    pub fn client() -> Result<Self> {
        let dht = Dht::client().map_err(|e| DhtError::Unavailable(e.to_string()))?;
        Ok(Self {
            dht: dht.as_async(),
        })
    }
}

fn salt_option(salt: &[u8]) -> Option<&[u8]> {
    if salt.is_empty() { None } else { Some(salt) }
}

fn to_target(id: &Id) -> Target {
    Target(*id.as_bytes())
}

#[async_trait]
impl DhtClient for MainlineDht {
    async fn put_mutable(&self, item: MutableItem) -> Result<Target> {
        let mainline_item = mainline::MutableItem::new_signed_unchecked(
            item.key,
            item.signature,
            &item.value,
            item.seq,
            salt_option(&item.salt),
        );
        let id = self
            .dht
            .put_mutable(mainline_item, None)
            .await
            .map_err(|e| DhtError::PutFailed(e.to_string()))?;
        debug!(item_target = %hex::encode(id.as_bytes()), seq = item.seq, "mutable item stored");
        Ok(to_target(&id))
    }

    async fn get_mutable(&self, key: &[u8; 32], salt: &[u8]) -> Result<Option<MutableItem>> {
        let found = self
            .dht
            .get_mutable_most_recent(key, salt_option(salt))
            .await;
        Ok(found.map(|item| MutableItem {
            key: *item.key(),
            salt: item.salt().map(<[u8]>::to_vec).unwrap_or_default(),
            seq: item.seq(),
            value: item.value().to_vec(),
            signature: *item.signature(),
        }))
    }

    async fn put_immutable(&self, value: &[u8]) -> Result<Target> {
        let id = self
            .dht
            .put_immutable(value)
            .await
            .map_err(|e| DhtError::PutFailed(e.to_string()))?;
        Ok(to_target(&id))
    }

    async fn get_immutable(&self, target: Target) -> Result<Option<Vec<u8>>> {
        let id = Id::from_bytes(target.as_bytes()).map_err(|e| DhtError::GetFailed(e.to_string()))?;
        Ok(self.dht.get_immutable(id).await.map(|value| value.to_vec()))
    }
}
