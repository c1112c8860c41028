//! Minimal Nostr relay client.
//!
//! Only what missing-note retrieval needs: a WebSocket connection that can
//! subscribe with typed filters, and [`fetch_event`] to pull one event by id.

pub mod error;
pub mod query;
pub mod relay;
pub mod subscription;

pub use error::{ClientError, Result};
pub use query::fetch_event;
pub use relay::{RelayConnection, RelayMessage, parse_relay_message, relay_url};
pub use subscription::Subscription;
