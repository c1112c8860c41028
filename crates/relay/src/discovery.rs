//! Finding peer relays: signed descriptors from the DHT or a NIP-11 endpoint.

use std::sync::Arc;
use std::time::Duration;

use nostr::RelayDescriptor;
use nostr::nip11::verify_descriptor;
use openagents_dht::{Bep44Transport, DhtError};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::store::{RelayStore, StoreError, SyncRelay};

const NOSTR_JSON: &str = "application/nostr+json";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("DHT lookup failed: {0}")]
    Dht(#[from] DhtError),
    #[error("relay info request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay info request returned status {0}")]
    Status(u16),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] nostr::Nip11Error),
    #[error("descriptor for {pubkey} is older than the stored one ({offered} < {stored})")]
    Stale {
        pubkey: String,
        stored: u64,
        offered: u64,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid relay url {0}")]
    InvalidUrl(String),
}

pub struct Discovery {
    transport: Bep44Transport,
    relays: Arc<dyn RelayStore>,
    http: reqwest::Client,
    http_timeout: Duration,
}

impl Discovery {
    pub fn new(transport: Bep44Transport, relays: Arc<dyn RelayStore>, http_timeout: Duration) -> Self {
        Self {
            transport,
            relays,
            http: reqwest::Client::new(),
            http_timeout,
        }
    }

    /// Fetch the descriptor published under `dht_key` with an empty salt.
    pub async fn discover_from_dht(&self, dht_key: &[u8; 32]) -> Result<SyncRelay, DiscoveryError> {
        let payload = self.transport.get(dht_key, b"").await?;
        let descriptor = RelayDescriptor::from_json(&payload)?;
        debug!(dht_key = %hex::encode(dht_key), pubkey = %descriptor.pubkey, "descriptor found in DHT");
        self.accept(descriptor).await
    }

    /// Fetch the NIP-11 document served at `url` (ws, wss, http or https).
    pub async fn discover_from_http(&self, url: &str) -> Result<SyncRelay, DiscoveryError> {
        let info_url = relay_info_url(url)?;
        let response = self
            .http
            .get(info_url.as_str())
            .timeout(self.http_timeout)
            .header("accept", NOSTR_JSON)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        let descriptor = RelayDescriptor::from_json(&body)?;
        debug!(relay = %info_url, pubkey = %descriptor.pubkey, "descriptor fetched over HTTP");
        self.accept(descriptor).await
    }

    /// Verify `descriptor` and upsert it unless the stored copy is newer.
    pub async fn accept(&self, descriptor: RelayDescriptor) -> Result<SyncRelay, DiscoveryError> {
        verify_descriptor(&descriptor)?;

        let offered = descriptor.last_updated().unwrap_or_default();
        if let Some(stored) = self.relays.relay(&descriptor.pubkey).await? {
            let stored = stored.last_updated();
            if offered < stored {
                return Err(DiscoveryError::Stale {
                    pubkey: descriptor.pubkey,
                    stored,
                    offered,
                });
            }
        }

        let relay = SyncRelay::new(descriptor);
        self.relays.add_relay(relay.clone()).await?;
        info!(pubkey = %relay.pubkey, last_updated = offered, "peer relay accepted");
        Ok(relay)
    }
}

/// HTTP(S) URL of a relay's information document.
pub fn relay_info_url(url: &str) -> Result<Url, DiscoveryError> {
    let mut parsed = Url::parse(url).map_err(|_| DiscoveryError::InvalidUrl(url.to_string()))?;
    let scheme = match parsed.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return Err(DiscoveryError::InvalidUrl(url.to_string())),
    };
    parsed
        .set_scheme(scheme)
        .map_err(|()| DiscoveryError::InvalidUrl(url.to_string()))?;
    Ok(parsed)
}
