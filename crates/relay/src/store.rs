//! Persisted relay state: pending DHT publications, authors to keep in sync,
//! known peer relays, and the local event store.
//!
//! Every record is keyed by pubkey and written with upsert semantics. The
//! SQLite store serializes access through its single connection; the memory
//! store through its mutex.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use nostr::{Event, Filter, RelayDescriptor, verify_event};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("stale sequence number {attempted} for {pubkey}, stored {current}")]
    StaleSequence {
        pubkey: String,
        current: i64,
        attempted: i64,
    },
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("db error: {0}")]
    Db(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Db(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Db(format!("stored JSON: {error}"))
    }
}

/// One recurring BEP44 publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtUploadable {
    /// Ed25519 publication key; the item target is `SHA-1(pubkey)`.
    pub pubkey: [u8; 32],
    /// Real payload bytes, bencoded once more when published.
    pub payload: Vec<u8>,
    pub signature: [u8; 64],
    pub seq: i64,
}

/// A peer relay's last accepted descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRelay {
    pub pubkey: String,
    pub descriptor: RelayDescriptor,
}

impl SyncRelay {
    pub fn new(descriptor: RelayDescriptor) -> Self {
        Self {
            pubkey: descriptor.pubkey.clone(),
            descriptor,
        }
    }

    pub fn last_updated(&self) -> u64 {
        self.descriptor.last_updated().unwrap_or_default()
    }
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Insert or replace the uploadable for `uploadable.pubkey`. A sequence
    /// number lower than the stored one is rejected; an equal one replaces.
    async fn add_uploadable(&self, uploadable: DhtUploadable) -> Result<(), StoreError>;

    async fn uploadables(&self) -> Result<Vec<DhtUploadable>, StoreError>;

    async fn add_author(&self, pubkey: &str) -> Result<(), StoreError>;

    async fn authors(&self) -> Result<Vec<String>, StoreError>;

    async fn add_relay(&self, relay: SyncRelay) -> Result<(), StoreError>;

    async fn relay(&self, pubkey: &str) -> Result<Option<SyncRelay>, StoreError>;

    async fn relays(&self) -> Result<Vec<SyncRelay>, StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Verify and store `event`. Returns `false` when it was already present.
    async fn store_event(&self, event: &Event) -> Result<bool, StoreError>;

    /// Events matching `filter`, newest first, honoring `filter.limit`.
    async fn query_events(&self, filter: &Filter) -> Result<Vec<Event>, StoreError>;
}

pub fn memory() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::default())
}

pub fn sqlite(path: &Path) -> Result<Arc<SqliteStore>, StoreError> {
    Ok(Arc::new(SqliteStore::open(path)?))
}

fn check_event(event: &Event) -> Result<(), StoreError> {
    match verify_event(event) {
        Ok(true) => Ok(()),
        Ok(false) => Err(StoreError::InvalidEvent(format!(
            "{}: id or signature mismatch",
            event.id
        ))),
        Err(error) => Err(StoreError::InvalidEvent(format!("{}: {error}", event.id))),
    }
}

fn newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    uploadables: BTreeMap<[u8; 32], DhtUploadable>,
    authors: BTreeMap<String, ()>,
    relays: BTreeMap<String, SyncRelay>,
    events: HashMap<String, Event>,
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn add_uploadable(&self, uploadable: DhtUploadable) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.uploadables.get(&uploadable.pubkey)
            && existing.seq > uploadable.seq
        {
            return Err(StoreError::StaleSequence {
                pubkey: hex::encode(uploadable.pubkey),
                current: existing.seq,
                attempted: uploadable.seq,
            });
        }
        inner.uploadables.insert(uploadable.pubkey, uploadable);
        Ok(())
    }

    async fn uploadables(&self) -> Result<Vec<DhtUploadable>, StoreError> {
        Ok(self.inner.lock().await.uploadables.values().cloned().collect())
    }

    async fn add_author(&self, pubkey: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .authors
            .insert(pubkey.to_ascii_lowercase(), ());
        Ok(())
    }

    async fn authors(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().await.authors.keys().cloned().collect())
    }

    async fn add_relay(&self, relay: SyncRelay) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .relays
            .insert(relay.pubkey.clone(), relay);
        Ok(())
    }

    async fn relay(&self, pubkey: &str) -> Result<Option<SyncRelay>, StoreError> {
        Ok(self.inner.lock().await.relays.get(pubkey).cloned())
    }

    async fn relays(&self) -> Result<Vec<SyncRelay>, StoreError> {
        Ok(self.inner.lock().await.relays.values().cloned().collect())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn store_event(&self, event: &Event) -> Result<bool, StoreError> {
        check_event(event)?;
        let mut inner = self.inner.lock().await;
        if inner.events.contains_key(&event.id) {
            return Ok(false);
        }
        inner.events.insert(event.id.clone(), event.clone());
        Ok(true)
    }

    async fn query_events(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().await;
        let mut events: Vec<Event> = inner
            .events
            .values()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        newest_first(&mut events);
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

/// SQLite-backed store. Statements run on the blocking pool.
pub struct SqliteStore {
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        debug!(path = %path.display(), "relay store opened");
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dht_uploadables (
                 pubkey BLOB PRIMARY KEY,
                 payload BLOB NOT NULL,
                 signature BLOB NOT NULL,
                 seq INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS sync_authors (
                 pubkey TEXT PRIMARY KEY
             );
             CREATE TABLE IF NOT EXISTS sync_relays (
                 pubkey TEXT PRIMARY KEY,
                 descriptor TEXT NOT NULL,
                 last_updated INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS events (
                 id TEXT PRIMARY KEY,
                 pubkey TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 kind INTEGER NOT NULL,
                 raw_event TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey);
             CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
             CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);",
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Db("connection lock poisoned".to_string()))?;
            op(&mut conn)
        })
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?
    }
}

fn blob_array<const N: usize>(bytes: Vec<u8>, column: &str) -> Result<[u8; N], StoreError> {
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| StoreError::Db(format!("{column} has {} bytes, expected {N}", bytes.len())))
}

#[async_trait]
impl RelayStore for SqliteStore {
    async fn add_uploadable(&self, uploadable: DhtUploadable) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM dht_uploadables WHERE pubkey = ?1",
                    params![uploadable.pubkey.as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(current) = current
                && current > uploadable.seq
            {
                return Err(StoreError::StaleSequence {
                    pubkey: hex::encode(uploadable.pubkey),
                    current,
                    attempted: uploadable.seq,
                });
            }
            tx.execute(
                "INSERT INTO dht_uploadables (pubkey, payload, signature, seq)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(pubkey) DO UPDATE SET
                     payload = excluded.payload,
                     signature = excluded.signature,
                     seq = excluded.seq",
                params![
                    uploadable.pubkey.as_slice(),
                    uploadable.payload,
                    uploadable.signature.as_slice(),
                    uploadable.seq,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn uploadables(&self) -> Result<Vec<DhtUploadable>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pubkey, payload, signature, seq FROM dht_uploadables ORDER BY pubkey",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut uploadables = Vec::new();
            for row in rows {
                let (pubkey, payload, signature, seq) = row?;
                uploadables.push(DhtUploadable {
                    pubkey: blob_array(pubkey, "pubkey")?,
                    payload,
                    signature: blob_array(signature, "signature")?,
                    seq,
                });
            }
            Ok(uploadables)
        })
        .await
    }

    async fn add_author(&self, pubkey: &str) -> Result<(), StoreError> {
        let pubkey = pubkey.to_ascii_lowercase();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sync_authors (pubkey) VALUES (?1) ON CONFLICT(pubkey) DO NOTHING",
                params![pubkey],
            )?;
            Ok(())
        })
        .await
    }

    async fn authors(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT pubkey FROM sync_authors ORDER BY pubkey")?;
            let authors = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(authors)
        })
        .await
    }

    async fn add_relay(&self, relay: SyncRelay) -> Result<(), StoreError> {
        let descriptor = serde_json::to_string(&relay.descriptor)?;
        let last_updated = i64::try_from(relay.last_updated()).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sync_relays (pubkey, descriptor, last_updated)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(pubkey) DO UPDATE SET
                     descriptor = excluded.descriptor,
                     last_updated = excluded.last_updated",
                params![relay.pubkey, descriptor, last_updated],
            )?;
            Ok(())
        })
        .await
    }

    async fn relay(&self, pubkey: &str) -> Result<Option<SyncRelay>, StoreError> {
        let pubkey = pubkey.to_string();
        self.with_conn(move |conn| {
            let descriptor: Option<String> = conn
                .query_row(
                    "SELECT descriptor FROM sync_relays WHERE pubkey = ?1",
                    params![pubkey],
                    |row| row.get(0),
                )
                .optional()?;
            match descriptor {
                Some(json) => Ok(Some(SyncRelay {
                    pubkey,
                    descriptor: serde_json::from_str(&json)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn relays(&self) -> Result<Vec<SyncRelay>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT pubkey, descriptor FROM sync_relays ORDER BY pubkey")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(pubkey, json)| {
                    Ok(SyncRelay {
                        pubkey,
                        descriptor: serde_json::from_str(&json)?,
                    })
                })
                .collect()
        })
        .await
    }
}

/// WHERE clause and bind values for `filter`.
fn filter_clause(filter: &Filter) -> (String, Vec<SqlValue>) {
    fn any_of(column: &str, values: &[SqlValue], clauses: &mut Vec<String>) {
        if values.is_empty() {
            clauses.push("0".to_string());
        } else {
            let placeholders = vec!["?"; values.len()].join(", ");
            clauses.push(format!("{column} IN ({placeholders})"));
        }
    }

    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(ids) = &filter.ids {
        let bound: Vec<SqlValue> = ids.iter().map(|id| SqlValue::Text(id.clone())).collect();
        any_of("id", &bound, &mut clauses);
        values.extend(bound);
    }
    if let Some(authors) = &filter.authors {
        let bound: Vec<SqlValue> = authors
            .iter()
            .map(|author| SqlValue::Text(author.clone()))
            .collect();
        any_of("pubkey", &bound, &mut clauses);
        values.extend(bound);
    }
    if let Some(kinds) = &filter.kinds {
        let bound: Vec<SqlValue> = kinds
            .iter()
            .map(|kind| SqlValue::Integer(i64::from(*kind)))
            .collect();
        any_of("kind", &bound, &mut clauses);
        values.extend(bound);
    }
    if let Some(since) = filter.since {
        clauses.push("created_at >= ?".to_string());
        values.push(SqlValue::Integer(i64::try_from(since).unwrap_or(i64::MAX)));
    }
    if let Some(until) = filter.until {
        clauses.push("created_at <= ?".to_string());
        values.push(SqlValue::Integer(i64::try_from(until).unwrap_or(i64::MAX)));
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (clause, values)
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn store_event(&self, event: &Event) -> Result<bool, StoreError> {
        check_event(event)?;
        let raw_event = serde_json::to_string(event)?;
        let event = event.clone();
        let created_at = i64::try_from(event.created_at).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO events (id, pubkey, created_at, kind, raw_event)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event.id, event.pubkey, created_at, event.kind, raw_event],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn query_events(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let (clause, mut values) = filter_clause(filter);
        let mut sql = format!("SELECT raw_event FROM events{clause} ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let raws = stmt
                .query_map(params_from_iter(values), |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            raws.iter()
                .map(|raw| serde_json::from_str::<Event>(raw).map_err(StoreError::from))
                .collect()
        })
        .await
    }
}
