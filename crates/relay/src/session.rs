//! Reconciliation sessions over one bidirectional stream.
//!
//! The initiator seals a vector for its filter and sends NEG-OPEN; the
//! responder seals a vector for the received filter and answers. From there
//! both sides run the same loop, one message at a time:
//!
//! - NEG-MSG: the responder answers with the engine's next message. The
//!   initiator sends NEG-HAVE for ids the peer lacks, NEG-NEED for ids it
//!   lacks, and NEG-MSG while ranges remain. Once converged it sends
//!   NEG-CLOSE, or waits for one last NEG-HAVE if it still needs events.
//! - NEG-HAVE: events are stored one by one; bad ones are skipped.
//! - NEG-NEED: answered with NEG-HAVE, possibly empty.
//! - NEG-ERR / NEG-CLOSE: the session ends without error.
//!
//! Only the initiator decides when the session is over.

use std::sync::Arc;
use std::time::Duration;

use nostr::nip77::Nip77Error;
use nostr::{Event, Filter, Negentropy, NegentropyStorage};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::dag::DagDispatcher;
use crate::protocol::SyncMessage;
use crate::store::{EventStore, StoreError};

/// Upper bound on a single protocol line.
const MAX_LINE_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream closed by peer")]
    StreamClosed,
    #[error("peer idle for {0:?}")]
    IdleTimeout(Duration),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("bad filter: {0}")]
    BadFilter(String),
    #[error("reconciliation error: {0}")]
    Engine(#[from] Nip77Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unsupported stream protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("no dialable address for relay {0}")]
    NoDialableAddress(String),
}

impl SyncError {
    /// Errors caused by what the peer sent. These are reported back with
    /// NEG-ERR before the session ends.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_)
                | Self::UnknownMessageType(_)
                | Self::BadFilter(_)
                | Self::Engine(_)
        )
    }
}

/// Everything a session needs besides its stream.
pub struct SyncContext {
    pub events: Arc<dyn EventStore>,
    pub dag: DagDispatcher,
    pub frame_size_limit: u64,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// NEG-OPEN/NEG-MSG messages processed.
    pub rounds: usize,
    pub events_received: usize,
    pub events_sent: usize,
    pub events_rejected: usize,
    pub dag_dispatched: usize,
}

pub async fn run_initiator<S>(
    stream: S,
    ctx: Arc<SyncContext>,
    filter: Filter,
) -> Result<SessionReport, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = Session::new(stream, ctx, Role::Initiator);
    let result = session.open(filter).await;
    session.finish(result).await
}

pub async fn run_responder<S>(stream: S, ctx: Arc<SyncContext>) -> Result<SessionReport, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = Session::new(stream, ctx, Role::Responder);
    let result = session.run().await;
    session.finish(result).await
}

enum Step {
    Continue,
    Done,
}

struct Session<S> {
    stream: BufReader<S>,
    ctx: Arc<SyncContext>,
    role: Role,
    engine: Option<Negentropy>,
    filter: Option<Filter>,
    final_round: bool,
    report: SessionReport,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S, ctx: Arc<SyncContext>, role: Role) -> Self {
        Self {
            stream: BufReader::new(stream),
            ctx,
            role,
            engine: None,
            filter: None,
            final_round: false,
            report: SessionReport::default(),
        }
    }

    async fn finish(mut self, result: Result<(), SyncError>) -> Result<SessionReport, SyncError> {
        match result {
            Ok(()) => {
                debug!(role = ?self.role, report = ?self.report, "session complete");
                Ok(self.report)
            }
            Err(error) => {
                if error.is_protocol()
                    && let Err(send_error) = self.send(&SyncMessage::Err(error.to_string())).await
                {
                    debug!(error = %send_error, "could not report NEG-ERR to peer");
                }
                Err(error)
            }
        }
    }

    async fn open(&mut self, filter: Filter) -> Result<(), SyncError> {
        let storage = self.vector(&filter).await?;
        let mut engine = Negentropy::new(storage, self.ctx.frame_size_limit)?;
        let message = engine.initiate()?;
        self.engine = Some(engine);
        self.filter = Some(filter.clone());
        self.send(&SyncMessage::Open {
            filter,
            id_size: nostr::nip77::ID_SIZE,
            message,
        })
        .await?;
        self.run().await
    }

    async fn run(&mut self) -> Result<(), SyncError> {
        loop {
            let message = self.read().await?;
            debug!(role = ?self.role, kind = message.kind(), "received");
            if let Step::Done = self.handle(message).await? {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, message: SyncMessage) -> Result<Step, SyncError> {
        match message {
            SyncMessage::Open {
                filter, message, ..
            } => self.on_open(filter, message).await,
            SyncMessage::Msg(payload) => self.on_msg(payload).await,
            SyncMessage::Have(events) => self.on_have(events).await,
            SyncMessage::Need(ids) => self.on_need(ids).await,
            SyncMessage::Err(reason) => {
                warn!(role = ?self.role, reason = %reason, "peer ended session with NEG-ERR");
                Ok(Step::Done)
            }
            SyncMessage::Close => Ok(Step::Done),
        }
    }

    async fn on_open(&mut self, filter: Filter, message: Vec<u8>) -> Result<Step, SyncError> {
        if self.role == Role::Initiator || self.engine.is_some() {
            return Err(SyncError::MalformedMessage("unexpected NEG-OPEN".to_string()));
        }

        let storage = self.vector(&filter).await?;
        let mut engine = Negentropy::new(storage, self.ctx.frame_size_limit)?;
        let reply = engine.reconcile(&message)?;
        self.engine = Some(engine);
        self.filter = Some(filter);
        self.report.rounds += 1;
        self.send(&SyncMessage::Msg(reply)).await?;
        Ok(Step::Continue)
    }

    async fn on_msg(&mut self, payload: Vec<u8>) -> Result<Step, SyncError> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| SyncError::MalformedMessage("NEG-MSG before NEG-OPEN".to_string()))?;
        self.report.rounds += 1;

        if self.role == Role::Responder {
            let reply = engine.reconcile(&payload)?;
            if !reply.is_empty() {
                self.send(&SyncMessage::Msg(reply)).await?;
            }
            return Ok(Step::Continue);
        }

        let output = engine.reconcile_with_ids(&payload)?;
        if !output.have.is_empty() {
            let events = self.lookup(output.have.iter().map(hex::encode).collect()).await?;
            self.report.events_sent += events.len();
            self.send(&SyncMessage::have(&events)).await?;
        }
        if !output.need.is_empty() {
            let ids = output.need.iter().map(hex::encode).collect();
            self.send(&SyncMessage::Need(ids)).await?;
        }

        if !output.next.is_empty() {
            self.send(&SyncMessage::Msg(output.next)).await?;
            Ok(Step::Continue)
        } else if output.need.is_empty() {
            self.send(&SyncMessage::Close).await?;
            Ok(Step::Done)
        } else {
            self.final_round = true;
            Ok(Step::Continue)
        }
    }

    async fn on_have(&mut self, events: Vec<Value>) -> Result<Step, SyncError> {
        for value in events {
            let event: Event = match serde_json::from_value(value) {
                Ok(event) => event,
                Err(error) => {
                    warn!(error = %error, "skipping unparseable event in NEG-HAVE");
                    self.report.events_rejected += 1;
                    continue;
                }
            };
            if let Some(filter) = &self.filter
                && !filter.matches(&event)
            {
                warn!(event_id = %event.id, "skipping event outside the session filter");
                self.report.events_rejected += 1;
                continue;
            }

            match self.ctx.events.store_event(&event).await {
                Ok(true) => {
                    self.report.events_received += 1;
                    if self.ctx.dag.dispatch(&event) {
                        self.report.dag_dispatched += 1;
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(event_id = %event.id, error = %error, "skipping event from NEG-HAVE");
                    self.report.events_rejected += 1;
                }
            }
        }

        if self.final_round {
            self.send(&SyncMessage::Close).await?;
            return Ok(Step::Done);
        }
        Ok(Step::Continue)
    }

    async fn on_need(&mut self, ids: Vec<String>) -> Result<Step, SyncError> {
        let events = self.lookup(ids).await?;
        self.report.events_sent += events.len();
        self.send(&SyncMessage::have(&events)).await?;
        Ok(Step::Continue)
    }

    /// Sealed vector of every local event matching `filter`.
    async fn vector(&self, filter: &Filter) -> Result<NegentropyStorage, SyncError> {
        let events = self.ctx.events.query_events(filter).await?;
        let mut storage = NegentropyStorage::new();
        for event in &events {
            match event.id_bytes() {
                Ok(id) => storage.insert(event.created_at, &id)?,
                Err(error) => warn!(event_id = %event.id, error = %error, "leaving event out of vector"),
            }
        }
        storage.seal()?;
        Ok(storage)
    }

    /// Local events with the given ids, restricted to the session filter.
    async fn lookup(&self, ids: Vec<String>) -> Result<Vec<Event>, SyncError> {
        let mut filter = self.filter.clone().unwrap_or_default();
        filter.ids = Some(ids);
        filter.limit = None;
        Ok(self.ctx.events.query_events(&filter).await?)
    }

    async fn read(&mut self) -> Result<SyncMessage, SyncError> {
        let idle = self.ctx.idle_timeout;
        let mut line = String::new();
        let mut limited = (&mut self.stream).take(MAX_LINE_BYTES);
        let read = timeout(idle, limited.read_line(&mut line))
            .await
            .map_err(|_| SyncError::IdleTimeout(idle))??;

        if read == 0 {
            return Err(SyncError::StreamClosed);
        }
        if !line.ends_with('\n') && read as u64 >= MAX_LINE_BYTES {
            return Err(SyncError::MalformedMessage(format!(
                "line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
        SyncMessage::decode(line.trim_end())
    }

    async fn send(&mut self, message: &SyncMessage) -> Result<(), SyncError> {
        let mut line = message.encode()?;
        line.push('\n');
        debug!(role = ?self.role, kind = message.kind(), bytes = line.len(), "sending");

        let idle = self.ctx.idle_timeout;
        let writer = self.stream.get_mut();
        timeout(idle, async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| SyncError::IdleTimeout(idle))??;
        Ok(())
    }
}
