pub mod filter;
pub mod nip01;
pub mod nip11;
pub mod nip77;
mod tag_parsing;

pub use filter::Filter;
pub use nip01::{
    Event, EventTemplate, Nip01Error, UnsignedEvent, finalize_event, generate_secret_key,
    get_event_hash, get_public_key, get_public_key_hex, validate_event, verify_event,
};
pub use nip11::{Nip11Error, P2pExtension, RelayDescriptor};
pub use nip77::{Negentropy, NegentropyStorage, Nip77Error, ReconcileOutput};
