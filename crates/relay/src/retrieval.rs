//! Missing-note retrieval.
//!
//! When a referenced note is not in the local store, look up the author's
//! relay list in the DHT (a BEP44 item under the author's nostr key) and ask
//! each listed relay for the note by id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::nip01::KIND_RELAY_LIST;
use nostr::{Event, EventTemplate, Filter, Nip01Error, finalize_event, verify_event};
use nostr_client::ClientError;
use openagents_dht::signing::{schnorr_public_key, sign_schnorr, signing_input};
use openagents_dht::{
    Bep44Transport, DhtError, PutValue, Target, bencode_bytes, derive_dht_key_for_public_key,
    mutable_target,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::parse_key_hex;
use crate::store::EventStore;

/// Replaceable relay list event kind.

const RELAY_TAG: &str = "r";

#[derive(Debug, Error)]
pub enum RelayListError {
    #[error("relay list is neither a URL array nor an event: {0}")]
    Malformed(String),
    #[error("relay list event does not verify")]
    BadSignature,
    #[error("relay list event is signed by {found}, expected {expected}")]
    WrongAuthor { expected: String, found: String },
    #[error("event error: {0}")]
    Event(#[from] Nip01Error),
    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),
}

/// Where notes are fetched from once a relay URL is known.
#[async_trait]
pub trait RelayQuery: Send + Sync {
    async fn fetch_event(&self, relay_url: &str, event_id: &str) -> Result<Option<Event>, ClientError>;
}

/// Short-lived WebSocket subscription per request.
pub struct WebSocketQuery {
    pub wait: Duration,
}

#[async_trait]
impl RelayQuery for WebSocketQuery {
    async fn fetch_event(&self, relay_url: &str, event_id: &str) -> Result<Option<Event>, ClientError> {
        nostr_client::fetch_event(relay_url, event_id, self.wait).await
    }
}

pub struct NoteRetriever {
    events: Arc<dyn EventStore>,
    transport: Bep44Transport,
    query: Arc<dyn RelayQuery>,
}

impl NoteRetriever {
    pub fn new(events: Arc<dyn EventStore>, transport: Bep44Transport, query: Arc<dyn RelayQuery>) -> Self {
        Self {
            events,
            transport,
            query,
        }
    }

    /// The note `event_id` by `author`, from the local store or from one of
    /// the author's relays. Every failure along the way is logged and
    /// treated as "not found".
    pub async fn retrieve_missing_note(&self, event_id: &str, author: &str) -> Option<Event> {
        match self
            .events
            .query_events(&Filter::new().ids([event_id]).limit(1))
            .await
        {
            Ok(mut found) if !found.is_empty() => return Some(found.remove(0)),
            Ok(_) => {}
            Err(error) => warn!(event_id = %event_id, error = %error, "local lookup failed"),
        }

        let author_key = match parse_key_hex(author) {
            Ok(key) => key,
            Err(error) => {
                warn!(author = %author, error = %error, "invalid author pubkey");
                return None;
            }
        };
        debug!(
            author = %author,
            dht_key = %derive_dht_key_for_public_key(&author_key),
            "looking up relay list"
        );

        let urls = match self.relay_list(&author_key, author).await {
            Ok(urls) => urls,
            Err(error) => {
                warn!(author = %author, error = %error, "relay list unavailable");
                return None;
            }
        };

        for url in urls {
            let event = match self.query.fetch_event(&url, event_id).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!(relay = %url, event_id = %event_id, "relay does not have the note");
                    continue;
                }
                Err(error) => {
                    warn!(relay = %url, error = %error, "note request failed");
                    continue;
                }
            };

            if event.id != event_id || event.pubkey != author || !matches!(verify_event(&event), Ok(true)) {
                warn!(relay = %url, event_id = %event.id, "relay served a note that does not match the request");
                continue;
            }

            if let Err(error) = self.events.store_event(&event).await {
                warn!(event_id = %event_id, error = %error, "could not persist retrieved note");
            }
            info!(relay = %url, event_id = %event_id, "missing note retrieved");
            return Some(event);
        }
        None
    }

    async fn relay_list(&self, author_key: &[u8; 32], author: &str) -> Result<Vec<String>, RelayListError> {
        let payload = self.transport.get(author_key, b"").await?;
        parse_relay_list(&payload, author)
    }
}

/// Relay URLs from a DHT relay-list payload: either a JSON array of URLs or
/// a relay list event signed by `author` whose `r` tags carry the URLs.
/// Duplicates and non-WebSocket URLs are dropped.
pub fn parse_relay_list(payload: &[u8], author: &str) -> Result<Vec<String>, RelayListError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|error| RelayListError::Malformed(error.to_string()))?;

    let candidates: Vec<String> = match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::Object(_) => {
            let event: Event = serde_json::from_value(value)
                .map_err(|error| RelayListError::Malformed(error.to_string()))?;
            if !verify_event(&event)? {
                return Err(RelayListError::BadSignature);
            }
            if event.pubkey != author {
                return Err(RelayListError::WrongAuthor {
                    expected: author.to_string(),
                    found: event.pubkey,
                });
            }
            event.tag_values(RELAY_TAG)
        }
        other => return Err(RelayListError::Malformed(format!("unexpected JSON {other}"))),
    };

    let mut urls: Vec<String> = Vec::with_capacity(candidates.len());
    for url in candidates {
        let url = url.trim().to_string();
        if (url.starts_with("ws://") || url.starts_with("wss://")) && !urls.contains(&url) {
            urls.push(url);
        }
    }
    Ok(urls)
}

/// Publish a relay list event for the nostr key `secret_key` under that key's
/// x-only public key, signed with Schnorr.
pub async fn publish_relay_list(
    transport: &Bep44Transport,
    secret_key: &[u8; 32],
    urls: &[String],
    created_at: u64,
) -> Result<Target, RelayListError> {
    let event = finalize_event(
        &EventTemplate {
            created_at,
            kind: KIND_RELAY_LIST,
            tags: urls
                .iter()
                .map(|url| vec![RELAY_TAG.to_string(), url.clone()])
                .collect(),
            content: String::new(),
        },
        secret_key,
    )?;
    let payload = serde_json::to_vec(&event).map_err(|error| RelayListError::Malformed(error.to_string()))?;
    let key = schnorr_public_key(secret_key)?;
    let value = bencode_bytes(&payload);

    let target = transport
        .put(mutable_target(&key, b""), &key, b"", |seq| {
            Ok(PutValue {
                signature: sign_schnorr(secret_key, &signing_input(b"", seq, &value))?,
                value: value.clone(),
                seq,
            })
        })
        .await?;
    info!(pubkey = %event.pubkey, relays = urls.len(), "relay list published");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use nostr::get_public_key_hex;
    use openagents_dht::{DEFAULT_MAX_WAIT, MemoryDht};
    use tokio::sync::Mutex;

    use super::*;
    use crate::store::{self, MemoryStore};

    const AUTHOR: [u8; 32] = [0x51; 32];
    const STRANGER: [u8; 32] = [0x52; 32];

    #[derive(Default)]
    struct FakeRelays {
        notes: HashMap<String, Event>,
        asked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelayQuery for FakeRelays {
        async fn fetch_event(&self, relay_url: &str, _event_id: &str) -> Result<Option<Event>, ClientError> {
            self.asked.lock().await.push(relay_url.to_string());
            match relay_url {
                "wss://down.example" => Err(ClientError::Timeout("down".to_string())),
                _ => Ok(self.notes.get(relay_url).cloned()),
            }
        }
    }

    fn note(secret: &[u8; 32], content: &str) -> Event {
        finalize_event(
            &EventTemplate {
                created_at: 1_700_000_000,
                kind: 1,
                tags: vec![],
                content: content.to_string(),
            },
            secret,
        )
        .unwrap()
    }

    fn author() -> String {
        get_public_key_hex(&AUTHOR).unwrap()
    }

    fn transport() -> Bep44Transport {
        Bep44Transport::new(Arc::new(MemoryDht::new()), DEFAULT_MAX_WAIT)
    }

    fn retriever(
        transport: Bep44Transport,
        relays: FakeRelays,
    ) -> (NoteRetriever, Arc<MemoryStore>, Arc<FakeRelays>) {
        let events = store::memory();
        let relays = Arc::new(relays);
        let retriever = NoteRetriever::new(events.clone(), transport, relays.clone());
        (retriever, events, relays)
    }

    #[tokio::test]
    async fn local_note_skips_the_network() {
        let wanted = note(&AUTHOR, "local");
        let (retriever, events, relays) = retriever(transport(), FakeRelays::default());
        events.store_event(&wanted).await.unwrap();

        let found = retriever.retrieve_missing_note(&wanted.id, &author()).await;
        assert_eq!(found, Some(wanted));
        assert!(relays.asked.lock().await.is_empty());
    }

    #[tokio::test]
    async fn note_is_fetched_from_the_authors_relays_and_stored() {
        let wanted = note(&AUTHOR, "remote");
        let transport = transport();
        let urls = vec![
            "wss://down.example".to_string(),
            "wss://empty.example".to_string(),
            "wss://has.example".to_string(),
        ];
        publish_relay_list(&transport, &AUTHOR, &urls, 1_700_000_000)
            .await
            .unwrap();

        let relays = FakeRelays {
            notes: HashMap::from([("wss://has.example".to_string(), wanted.clone())]),
            ..FakeRelays::default()
        };
        let (retriever, events, relays) = retriever(transport, relays);

        let found = retriever.retrieve_missing_note(&wanted.id, &author()).await;
        assert_eq!(found.as_ref(), Some(&wanted));
        assert_eq!(*relays.asked.lock().await, urls);

        let stored = events
            .query_events(&Filter::new().ids([wanted.id.as_str()]))
            .await
            .unwrap();
        assert_eq!(stored, vec![wanted]);
    }

    #[tokio::test]
    async fn note_by_another_author_is_not_accepted() {
        let impostor = note(&STRANGER, "impostor");
        let transport = transport();
        publish_relay_list(&transport, &AUTHOR, &["wss://evil.example".to_string()], 1)
            .await
            .unwrap();
        let relays = FakeRelays {
            notes: HashMap::from([("wss://evil.example".to_string(), impostor.clone())]),
            ..FakeRelays::default()
        };
        let (retriever, events, _) = retriever(transport, relays);

        assert_eq!(retriever.retrieve_missing_note(&impostor.id, &author()).await, None);
        assert!(events.query_events(&Filter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_relay_list_or_bad_author_is_not_found() {
        let (retriever, _, relays) = retriever(transport(), FakeRelays::default());
        assert_eq!(retriever.retrieve_missing_note(&"00".repeat(32), &author()).await, None);
        assert_eq!(retriever.retrieve_missing_note(&"00".repeat(32), "not-hex").await, None);
        assert!(relays.asked.lock().await.is_empty());
    }

    #[test]
    fn relay_list_payloads() {
        let author = author();
        let list = note(&AUTHOR, "");
        let mut tagged = finalize_event(
            &EventTemplate {
                created_at: 1,
                kind: KIND_RELAY_LIST,
                tags: vec![
                    vec!["r".to_string(), "wss://a.example".to_string()],
                    vec!["r".to_string(), "wss://a.example".to_string()],
                    vec!["r".to_string(), "https://not-ws.example".to_string()],
                    vec!["r".to_string(), "ws://b.example".to_string()],
                ],
                content: String::new(),
            },
            &AUTHOR,
        )
        .unwrap();

        assert_eq!(
            parse_relay_list(br#"["wss://a.example","wss://a.example",3]"#, &author).unwrap(),
            vec!["wss://a.example".to_string()]
        );
        assert_eq!(
            parse_relay_list(&serde_json::to_vec(&tagged).unwrap(), &author).unwrap(),
            vec!["wss://a.example".to_string(), "ws://b.example".to_string()]
        );
        assert!(parse_relay_list(&serde_json::to_vec(&list).unwrap(), &author)
            .unwrap()
            .is_empty());

        let stranger = note(&STRANGER, "");
        assert!(matches!(
            parse_relay_list(&serde_json::to_vec(&stranger).unwrap(), &author),
            Err(RelayListError::WrongAuthor { .. })
        ));

        tagged.content = "tampered".to_string();
        assert!(matches!(
            parse_relay_list(&serde_json::to_vec(&tagged).unwrap(), &author),
            Err(RelayListError::BadSignature)
        ));
        assert!(matches!(
            parse_relay_list(b"42", &author),
            Err(RelayListError::Malformed(_))
        ));
    }
}
