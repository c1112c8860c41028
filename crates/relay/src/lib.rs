//! Relay node peer discovery over the Mainline DHT and event synchronization
//! with peer relays over negentropy sessions.

pub mod config;
pub mod dag;
pub mod discovery;
pub mod dispatcher;
pub mod identity;
pub mod protocol;
pub mod retrieval;
pub mod scheduler;
pub mod session;
pub mod store;

pub use config::{Config, ConfigError};
pub use dag::{DagDispatcher, DagDownloader, DagError, UnconfiguredDagDownloader};
pub use discovery::{Discovery, DiscoveryError};
pub use dispatcher::{Dispatcher, dial, dial_relay, dialable_addr};
pub use identity::{IdentityError, RelayIdentity};
pub use protocol::{PROTOCOL_NAME, SyncMessage};
pub use retrieval::{NoteRetriever, RelayQuery, WebSocketQuery, publish_relay_list};
pub use scheduler::{Scheduler, SyncRoundReport, UploadReport};
pub use session::{Role, SessionReport, SyncContext, SyncError, run_initiator, run_responder};
pub use store::{
    DhtUploadable, EventStore, MemoryStore, RelayStore, SqliteStore, StoreError, SyncRelay,
};
