//! A WebSocket connection to one relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nostr::Event;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::subscription::Subscription;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type Subscriptions = Arc<Mutex<HashMap<String, Subscription>>>;

/// The relay-to-client frames this client acts on. Anything else
/// (`OK`, `AUTH`, `COUNT`, ...) is skipped by [`parse_relay_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    Eose(String),
    Closed {
        subscription_id: String,
        reason: String,
    },
    Notice(String),
}

/// An open connection. Frames are read on a background task; EVENTs that a
/// tracked subscription's filters reject never reach [`recv`](Self::recv).
pub struct RelayConnection {
    url: Url,
    writer: Mutex<WsWriter>,
    inbound: Mutex<mpsc::UnboundedReceiver<RelayMessage>>,
    subscriptions: Subscriptions,
    reader: JoinHandle<()>,
}

/// Only `ws://` and `wss://` URLs name a relay.
pub fn relay_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(ClientError::InvalidUrl(format!(
            "{url}: expected ws or wss, got {other}"
        ))),
    }
}

impl RelayConnection {
    pub async fn open(url: &str, connect_timeout: Duration) -> Result<Self> {
        let url = relay_url(url)?;
        let (stream, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("connecting to {url} took over {connect_timeout:?}"))
            })?
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;

        let (writer, reader) = stream.split();
        let subscriptions = Subscriptions::default();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(
            url.to_string(),
            reader,
            Arc::clone(&subscriptions),
            inbound_tx,
        ));

        Ok(Self {
            url,
            writer: Mutex::new(writer),
            inbound: Mutex::new(inbound_rx),
            subscriptions,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let request = subscription.request();
        self.subscriptions
            .lock()
            .await
            .insert(subscription.id.clone(), subscription);
        self.send(&request).await
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.subscriptions.lock().await.remove(subscription_id);
        self.send(&json!(["CLOSE", subscription_id])).await
    }

    /// Next queued frame; `None` after the relay hung up and the queue drained.
    pub async fn recv(&self) -> Option<RelayMessage> {
        self.inbound.lock().await.recv().await
    }

    /// Stop reading and send a close frame.
    pub async fn close(&self) -> Result<()> {
        self.reader.abort();
        self.writer
            .lock()
            .await
            .send(Message::Close(None))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    async fn send(&self, frame: &Value) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames(
    relay: String,
    mut frames: SplitStream<WsStream>,
    subscriptions: Subscriptions,
    inbound: mpsc::UnboundedSender<RelayMessage>,
) {
    while let Some(frame) = frames.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(error) => {
                warn!(relay = %relay, error = %error, "websocket read failed");
                break;
            }
        };

        let message = match parse_relay_message(text.as_str()) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(error) => {
                warn!(relay = %relay, error = %error, "unparseable relay frame");
                continue;
            }
        };

        if let RelayMessage::Event {
            subscription_id,
            event,
        } = &message
        {
            let rejected = subscriptions
                .lock()
                .await
                .get(subscription_id)
                .is_some_and(|subscription| !subscription.accepts(event));
            if rejected {
                debug!(relay = %relay, event_id = %event.id, "event outside subscription filters");
                continue;
            }
        }

        if inbound.send(message).is_err() {
            break;
        }
    }
}

/// Decode one relay frame. `Ok(None)` means the frame is well formed JSON
/// but not something this client handles.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let frame = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("relay frame is not a JSON array".to_string()))?;
    let Some(kind) = frame.first() else {
        return Ok(None);
    };
    let kind = kind
        .as_str()
        .ok_or_else(|| ClientError::Protocol("relay frame kind is not a string".to_string()))?;

    let message = match kind {
        "EVENT" => {
            let payload = frame
                .get(2)
                .cloned()
                .ok_or_else(|| ClientError::Protocol("EVENT frame without an event".to_string()))?;
            RelayMessage::Event {
                subscription_id: string_at(frame, 1, kind)?,
                event: serde_json::from_value(payload)
                    .map_err(|error| ClientError::Protocol(format!("EVENT payload: {error}")))?,
            }
        }
        "EOSE" => RelayMessage::Eose(string_at(frame, 1, kind)?),
        "CLOSED" => RelayMessage::Closed {
            subscription_id: string_at(frame, 1, kind)?,
            reason: frame
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "NOTICE" => RelayMessage::Notice(string_at(frame, 1, kind)?),
        _ => return Ok(None),
    };
    Ok(Some(message))
}

fn string_at(frame: &[Value], index: usize, kind: &str) -> Result<String> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::Protocol(format!("{kind} frame: element {index} is not a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventTemplate, finalize_event};

    fn event() -> Event {
        finalize_event(
            &EventTemplate {
                created_at: 1_700_000_000,
                kind: 1,
                tags: vec![vec!["t".to_string(), "relay".to_string()]],
                content: "hello".to_string(),
            },
            &[9; 32],
        )
        .unwrap()
    }

    #[test]
    fn parses_the_frames_fetching_depends_on() {
        let event = event();
        let cases = [
            (
                json!(["EVENT", "sub", event]),
                RelayMessage::Event {
                    subscription_id: "sub".to_string(),
                    event: event.clone(),
                },
            ),
            (json!(["EOSE", "sub"]), RelayMessage::Eose("sub".to_string())),
            (
                json!(["CLOSED", "sub", "error: shutting down"]),
                RelayMessage::Closed {
                    subscription_id: "sub".to_string(),
                    reason: "error: shutting down".to_string(),
                },
            ),
            (
                json!(["CLOSED", "sub"]),
                RelayMessage::Closed {
                    subscription_id: "sub".to_string(),
                    reason: String::new(),
                },
            ),
            (json!(["NOTICE", "slow down"]), RelayMessage::Notice("slow down".to_string())),
        ];

        for (frame, expected) in cases {
            let parsed = parse_relay_message(&frame.to_string()).unwrap();
            assert_eq!(parsed, Some(expected), "frame {frame}");
        }
    }

    #[test]
    fn skips_frames_it_does_not_handle() {
        for frame in [
            json!([]),
            json!(["OK", "id", true, ""]),
            json!(["AUTH", "challenge"]),
            json!(["COUNT", "sub", {"count": 3}]),
        ] {
            assert_eq!(parse_relay_message(&frame.to_string()).unwrap(), None, "frame {frame}");
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        for text in [
            "not json",
            r#"{"EVENT": 1}"#,
            "[1, 2]",
            r#"["EVENT", "sub"]"#,
            r#"["EVENT", 7, {}]"#,
            r#"["EVENT", "sub", {"id": "short"}]"#,
            r#"["EOSE"]"#,
            r#"["NOTICE", 5]"#,
        ] {
            assert!(parse_relay_message(text).is_err(), "accepted {text}");
        }
    }

    #[test]
    fn relay_urls_must_be_websocket() {
        assert!(relay_url("wss://relay.example").is_ok());
        assert!(relay_url("ws://127.0.0.1:7000/").is_ok());
        assert!(matches!(
            relay_url("https://relay.example"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(matches!(relay_url("relay"), Err(ClientError::UrlParse(_))));
    }
}
