//! The two periodic loops: republishing uploadables to the DHT and syncing
//! with known peer relays. Each item is handled on its own; a failure is
//! logged and the loop moves on.

use std::sync::Arc;
use std::time::Duration;

use nostr::Filter;
use openagents_dht::{Bep44Transport, PutValue, bencode_bytes, mutable_target};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::discovery::{Discovery, DiscoveryError};
use crate::dispatcher::dial_relay;
use crate::session::{SessionReport, SyncContext, SyncError, run_initiator};
use crate::store::{DhtUploadable, RelayStore, StoreError, SyncRelay};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub published: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRoundReport {
    pub discovered: usize,
    pub sessions: usize,
    pub failed: usize,
    pub events_received: usize,
    pub events_sent: usize,
}

pub struct Scheduler {
    relays: Arc<dyn RelayStore>,
    transport: Bep44Transport,
    discovery: Arc<Discovery>,
    sync: Arc<SyncContext>,
    own_pubkey: Option<String>,
    bootstrap_keys: Vec<[u8; 32]>,
    connect_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        relays: Arc<dyn RelayStore>,
        transport: Bep44Transport,
        discovery: Arc<Discovery>,
        sync: Arc<SyncContext>,
    ) -> Self {
        let connect_timeout = sync.idle_timeout;
        Self {
            relays,
            transport,
            discovery,
            sync,
            own_pubkey: None,
            bootstrap_keys: Vec::new(),
            connect_timeout,
        }
    }

    /// Never sync with the relay that has this pubkey (ourselves).
    pub fn with_own_pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.own_pubkey = Some(pubkey.into());
        self
    }

    /// DHT keys to re-discover at the start of every sync round.
    pub fn with_bootstrap_keys(mut self, keys: Vec<[u8; 32]>) -> Self {
        self.bootstrap_keys = keys;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn upload_once(&self) -> Result<UploadReport, StoreError> {
        let mut report = UploadReport::default();
        for uploadable in self.relays.uploadables().await? {
            match self.upload(&uploadable).await {
                Ok(()) => report.published += 1,
                Err(error) if error.is_recoverable() => {
                    report.failed += 1;
                    warn!(
                        pubkey = %hex::encode(uploadable.pubkey),
                        seq = uploadable.seq,
                        error = %error,
                        "DHT upload failed"
                    );
                }
                Err(error) => {
                    report.failed += 1;
                    error!(
                        pubkey = %hex::encode(uploadable.pubkey),
                        error = %error,
                        "uploadable cannot be published"
                    );
                }
            }
        }
        debug!(published = report.published, failed = report.failed, "upload round finished");
        Ok(report)
    }

    async fn upload(&self, uploadable: &DhtUploadable) -> Result<(), openagents_dht::DhtError> {
        let key = uploadable.pubkey;
        self.transport
            .put(mutable_target(&key, b""), &key, b"", |_| {
                Ok(PutValue {
                    value: bencode_bytes(&uploadable.payload),
                    seq: uploadable.seq,
                    signature: uploadable.signature,
                })
            })
            .await?;
        Ok(())
    }

    /// Filter covering every tracked author, or `None` when there are none.
    pub async fn author_filter(&self) -> Result<Option<Filter>, StoreError> {
        let authors = self.relays.authors().await?;
        if authors.is_empty() {
            return Ok(None);
        }
        Ok(Some(Filter::new().authors(authors)))
    }

    pub async fn sync_once(&self) -> Result<SyncRoundReport, StoreError> {
        let mut report = SyncRoundReport::default();

        for key in &self.bootstrap_keys {
            match self.discovery.discover_from_dht(key).await {
                Ok(_) => report.discovered += 1,
                Err(DiscoveryError::Stale { pubkey, .. }) => {
                    debug!(pubkey = %pubkey, "bootstrap descriptor unchanged or older");
                }
                Err(error) => {
                    warn!(dht_key = %hex::encode(key), error = %error, "bootstrap discovery failed");
                }
            }
        }

        let Some(filter) = self.author_filter().await? else {
            info!("no authors to sync; skipping round");
            return Ok(report);
        };

        for relay in self.relays.relays().await? {
            if self.own_pubkey.as_deref() == Some(relay.pubkey.as_str()) {
                continue;
            }
            report.sessions += 1;
            match self.sync_relay(&relay, filter.clone()).await {
                Ok(session) => {
                    report.events_received += session.events_received;
                    report.events_sent += session.events_sent;
                    info!(
                        relay = %relay.pubkey,
                        received = session.events_received,
                        sent = session.events_sent,
                        "sync finished"
                    );
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(relay = %relay.pubkey, error = %error, "sync failed");
                }
            }
        }
        Ok(report)
    }

    pub async fn sync_relay(&self, relay: &SyncRelay, filter: Filter) -> Result<SessionReport, SyncError> {
        let stream = dial_relay(&relay.descriptor, self.connect_timeout).await?;
        run_initiator(stream, Arc::clone(&self.sync), filter).await
    }

    /// Start both loops. The first tick of each fires immediately.
    pub fn spawn(
        self: Arc<Self>,
        upload_every: Duration,
        sync_every: Duration,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let uploader = Arc::clone(&self);
        let upload = tokio::spawn(async move {
            let mut ticker = interval(upload_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = uploader.upload_once().await {
                    warn!(error = %error, "upload round failed");
                }
            }
        });

        let sync = tokio::spawn(async move {
            let mut ticker = interval(sync_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = self.sync_once().await {
                    warn!(error = %error, "sync round failed");
                }
            }
        });

        (upload, sync)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use openagents_dht::{DEFAULT_MAX_WAIT, DhtClient, DhtError, MemoryDht, MutableItem, Target};

    use super::*;
    use crate::config::Config;
    use crate::dag::{DagDispatcher, UnconfiguredDagDownloader};
    use crate::identity::RelayIdentity;
    use crate::store;

    fn config() -> Config {
        let values: HashMap<&str, &str> = HashMap::new();
        Config::from_lookup(|key| values.get(key).map(ToString::to_string)).unwrap()
    }

    fn context() -> Arc<SyncContext> {
        Arc::new(SyncContext {
            events: store::memory(),
            dag: DagDispatcher::new(Arc::new(UnconfiguredDagDownloader), vec![]),
            frame_size_limit: 4096,
            idle_timeout: Duration::from_secs(1),
        })
    }

    fn scheduler(
        client: Arc<dyn DhtClient>,
        relays: Arc<store::MemoryStore>,
    ) -> (Scheduler, Bep44Transport) {
        let transport = Bep44Transport::new(client, DEFAULT_MAX_WAIT);
        let discovery = Arc::new(Discovery::new(
            transport.clone(),
            relays.clone(),
            Duration::from_secs(1),
        ));
        let scheduler = Scheduler::new(relays, transport.clone(), discovery, context())
            .with_connect_timeout(Duration::from_millis(200));
        (scheduler, transport)
    }

    /// Refuses every put for one key.
    struct PartialDht {
        inner: MemoryDht,
        refused: [u8; 32],
    }

    #[async_trait]
    impl DhtClient for PartialDht {
        async fn put_mutable(&self, item: MutableItem) -> Result<Target, DhtError> {
            if item.key == self.refused {
                return Err(DhtError::PutFailed("node refused".to_string()));
            }
            self.inner.put_mutable(item).await
        }

        async fn get_mutable(&self, key: &[u8; 32], salt: &[u8]) -> Result<Option<MutableItem>, DhtError> {
            self.inner.get_mutable(key, salt).await
        }

        async fn put_immutable(&self, value: &[u8]) -> Result<Target, DhtError> {
            self.inner.put_immutable(value).await
        }

        async fn get_immutable(&self, target: Target) -> Result<Option<Vec<u8>>, DhtError> {
            self.inner.get_immutable(target).await
        }
    }

    #[tokio::test]
    async fn upload_failure_does_not_block_other_items() {
        let first = RelayIdentity::from_secret([0x61; 32]).unwrap();
        let second = RelayIdentity::from_secret([0x62; 32]).unwrap();
        let relays = store::memory();
        for identity in [&first, &second] {
            let descriptor = identity.descriptor(&config(), 500).unwrap();
            relays
                .add_uploadable(identity.uploadable(&descriptor).unwrap())
                .await
                .unwrap();
        }

        let dht = Arc::new(PartialDht {
            inner: MemoryDht::new(),
            refused: first.dht_public_key(),
        });
        let (scheduler, transport) = scheduler(dht.clone(), relays);

        let report = scheduler.upload_once().await.unwrap();
        assert_eq!(report, UploadReport { published: 1, failed: 1 });
        assert!(transport.get(&second.dht_public_key(), b"").await.is_ok());
        assert_eq!(dht.inner.item_count().await, 1);

        // Republishing the same seq is accepted.
        assert_eq!(scheduler.upload_once().await.unwrap().published, 1);
    }

    #[tokio::test]
    async fn sync_round_rediscovers_bootstrap_keys_and_skips_without_authors() {
        let peer = RelayIdentity::from_secret([0x71; 32]).unwrap();
        let relays = store::memory();
        let (scheduler, transport) = scheduler(Arc::new(MemoryDht::new()), relays.clone());
        let scheduler = scheduler.with_bootstrap_keys(vec![peer.dht_public_key(), [0x72; 32]]);

        let uploadable = peer
            .uploadable(&peer.descriptor(&config(), 700).unwrap())
            .unwrap();
        let key = uploadable.pubkey;
        transport
            .put(mutable_target(&key, b""), &key, b"", |_| {
                Ok(PutValue {
                    value: bencode_bytes(&uploadable.payload),
                    seq: uploadable.seq,
                    signature: uploadable.signature,
                })
            })
            .await
            .unwrap();

        let report = scheduler.sync_once().await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.sessions, 0);
        assert!(relays.relay(peer.pubkey()).await.unwrap().is_some());

        // Same descriptor again is accepted; nothing else changes.
        assert_eq!(scheduler.sync_once().await.unwrap().discovered, 1);
    }

    #[tokio::test]
    async fn unreachable_relays_are_counted_and_own_relay_is_skipped() {
        let own = RelayIdentity::from_secret([0x81; 32]).unwrap();
        let relays = store::memory();
        relays.add_author(&"ab".repeat(32)).await.unwrap();
        relays
            .add_relay(SyncRelay::new(own.descriptor(&config(), 1).unwrap()))
            .await
            .unwrap();

        let values = HashMap::from([("RELAY_PUBLIC_ADDRS", "127.0.0.1:1")]);
        let unreachable_config =
            Config::from_lookup(|key| values.get(key).map(ToString::to_string)).unwrap();
        let peer = RelayIdentity::from_secret([0x82; 32]).unwrap();
        relays
            .add_relay(SyncRelay::new(peer.descriptor(&unreachable_config, 1).unwrap()))
            .await
            .unwrap();

        let (scheduler, _) = scheduler(Arc::new(MemoryDht::new()), relays);
        let scheduler = scheduler.with_own_pubkey(own.pubkey());

        let report = scheduler.sync_once().await.unwrap();
        assert_eq!(report.sessions, 1);
        assert_eq!(report.failed, 1);
    }
}
