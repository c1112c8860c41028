//! Hand-off of events that reference externally stored DAG content.
//!
//! The transfer itself (connection, leaf download, Merkle verification) lives
//! behind [`DagDownloader`]. Sessions only call [`DagDispatcher::dispatch`],
//! which spawns the download and returns immediately.

use std::sync::Arc;

use async_trait::async_trait;
use nostr::Event;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tag whose first value names the DAG root.
pub const ROOT_TAG: &str = "root";

#[derive(Debug, Error)]
#[error("DAG retrieval for {root} failed: {reason}")]
pub struct DagError {
    pub root: String,
    pub reason: String,
}

#[async_trait]
pub trait DagDownloader: Send + Sync {
    async fn download_and_verify(&self, root: &str) -> Result<(), DagError>;
}

/// Downloader for nodes without a DAG transfer backend. Logs and succeeds.
pub struct UnconfiguredDagDownloader;

#[async_trait]
impl DagDownloader for UnconfiguredDagDownloader {
    async fn download_and_verify(&self, root: &str) -> Result<(), DagError> {
        debug!(root = %root, "no DAG transfer backend configured; skipping retrieval");
        Ok(())
    }
}

#[derive(Clone)]
pub struct DagDispatcher {
    downloader: Arc<dyn DagDownloader>,
    kinds: Vec<u16>,
}

impl DagDispatcher {
    pub fn new(downloader: Arc<dyn DagDownloader>, kinds: Vec<u16>) -> Self {
        Self { downloader, kinds }
    }

    /// Root id for events of a qualifying kind that carry a non-empty root tag.
    pub fn root_for(&self, event: &Event) -> Option<String> {
        if !self.kinds.contains(&event.kind) {
            return None;
        }
        event
            .tag_value(ROOT_TAG)
            .filter(|root| !root.is_empty())
            .map(ToString::to_string)
    }

    /// Spawn retrieval for `event` if it qualifies. Returns whether a task was
    /// spawned; the outcome of the download is only logged.
    pub fn dispatch(&self, event: &Event) -> bool {
        let Some(root) = self.root_for(event) else {
            return false;
        };

        info!(root = %root, event_id = %event.id, "dispatching DAG retrieval");
        let downloader = Arc::clone(&self.downloader);
        tokio::spawn(async move {
            if let Err(error) = downloader.download_and_verify(&root).await {
                warn!(root = %error.root, reason = %error.reason, "DAG retrieval failed");
            }
        });
        true
    }
}
