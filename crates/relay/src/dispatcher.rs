//! Stream transport for reconciliation sessions.
//!
//! A dialer opens a TCP connection and writes [`PROTOCOL_NAME`] on its own
//! line; the listener checks it and hands the stream to a responder session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nostr::RelayDescriptor;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::protocol::PROTOCOL_NAME;
use crate::session::{SessionReport, SyncContext, SyncError, run_responder};

const MAX_PROTOCOL_LINE: u64 = 256;

pub struct Dispatcher {
    listener: TcpListener,
    ctx: Arc<SyncContext>,
}

impl Dispatcher {
    pub async fn bind(addr: SocketAddr, ctx: Arc<SyncContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept streams until the listener fails. Each stream gets its own task.
    pub async fn run(self) -> std::io::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "sync dispatcher listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                match accept_stream(stream, ctx).await {
                    Ok(report) => info!(
                        peer = %peer,
                        received = report.events_received,
                        sent = report.events_sent,
                        "inbound sync finished"
                    ),
                    Err(error) => warn!(peer = %peer, error = %error, "inbound sync failed"),
                }
            });
        }
    }
}

async fn accept_stream(stream: TcpStream, ctx: Arc<SyncContext>) -> Result<SessionReport, SyncError> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    let idle = ctx.idle_timeout;
    timeout(
        idle,
        (&mut stream).take(MAX_PROTOCOL_LINE).read_line(&mut line),
    )
    .await
    .map_err(|_| SyncError::IdleTimeout(idle))??;

    let requested = line.trim_end();
    if requested != PROTOCOL_NAME {
        return Err(SyncError::UnsupportedProtocol(requested.to_string()));
    }
    run_responder(stream, ctx).await
}

/// Open a stream to `addr` (`host:port`) and announce the protocol.
pub async fn dial(addr: &str, connect_timeout: Duration) -> Result<TcpStream, SyncError> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SyncError::IdleTimeout(connect_timeout))??;
    stream
        .write_all(format!("{PROTOCOL_NAME}\n").as_bytes())
        .await?;
    Ok(stream)
}

/// Dial the first advertised address of `descriptor` that accepts a connection.
pub async fn dial_relay(
    descriptor: &RelayDescriptor,
    connect_timeout: Duration,
) -> Result<TcpStream, SyncError> {
    let addrs = descriptor
        .hornet_extension
        .as_ref()
        .map(|ext| ext.libp2p_addrs.as_slice())
        .unwrap_or_default();

    for advertised in addrs {
        let Some(addr) = dialable_addr(advertised) else {
            debug!(addr = %advertised, "skipping undialable address");
            continue;
        };
        match dial(&addr, connect_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(error) => debug!(addr = %addr, error = %error, "dial failed"),
        }
    }
    Err(SyncError::NoDialableAddress(descriptor.pubkey.clone()))
}

/// `host:port` for a plain socket address or a TCP multiaddr
/// (`/ip4|ip6|dns|dns4|dns6/<host>/tcp/<port>[/...]`).
pub fn dialable_addr(advertised: &str) -> Option<String> {
    let advertised = advertised.trim();
    if !advertised.starts_with('/') {
        let (host, port) = advertised.rsplit_once(':')?;
        return (!host.is_empty() && port.parse::<u16>().is_ok()).then(|| advertised.to_string());
    }

    let mut parts = advertised.split('/').skip(1);
    let (protocol, host) = (parts.next()?, parts.next()?);
    if parts.next()? != "tcp" {
        return None;
    }
    let port: u16 = parts.next()?.parse().ok()?;
    if host.is_empty() {
        return None;
    }

    match protocol {
        "ip4" | "dns" | "dns4" | "dns6" => Some(format!("{host}:{port}")),
        "ip6" => Some(format!("[{host}]:{port}")),
        _ => None,
    }
}
