//! One-shot queries: connect, ask for a single event, disconnect.

use std::time::Duration;

use nostr::{Event, Filter, verify_event};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::relay::{RelayConnection, RelayMessage};
use crate::subscription::Subscription;

/// Ask the relay at `url` for the event with id `event_id`.
///
/// Returns the first event whose id matches and whose signature verifies,
/// or `None` once the relay signals EOSE or closes the subscription. The whole
/// exchange, connect included, is bounded by `wait`.
pub async fn fetch_event(url: &str, event_id: &str, wait: Duration) -> Result<Option<Event>> {
    let relay = RelayConnection::open(url, wait).await?;
    let subscription_id = format!("fetch-{}", event_id.chars().take(16).collect::<String>());

    let outcome = timeout(wait, await_event(&relay, &subscription_id, event_id)).await;
    if let Err(error) = relay.unsubscribe(&subscription_id).await {
        debug!(relay = %url, error = %error, "CLOSE not sent");
    }
    if let Err(error) = relay.close().await {
        debug!(relay = %url, error = %error, "disconnect failed");
    }

    outcome.map_err(|_| ClientError::Timeout(format!("no answer from {url} within {wait:?}")))?
}

async fn await_event(
    relay: &RelayConnection,
    subscription_id: &str,
    event_id: &str,
) -> Result<Option<Event>> {
    relay
        .subscribe(Subscription::new(
            subscription_id,
            vec![Filter::new().ids([event_id]).limit(1)],
        ))
        .await?;

    while let Some(message) = relay.recv().await {
        match message {
            RelayMessage::Event {
                subscription_id: sub,
                event,
            } if sub == subscription_id => {
                if event.id != event_id {
                    continue;
                }
                match verify_event(&event) {
                    Ok(true) => return Ok(Some(event)),
                    Ok(false) => {
                        warn!(relay = %relay.url(), event_id = %event.id, "relay served an event with a bad signature");
                    }
                    Err(error) => {
                        warn!(relay = %relay.url(), error = %error, "relay served a malformed event");
                    }
                }
            }
            RelayMessage::Eose(sub)
            | RelayMessage::Closed {
                subscription_id: sub,
                ..
            } if sub == subscription_id => {
                return Ok(None);
            }
            RelayMessage::Notice(notice) => {
                debug!(relay = %relay.url(), notice = %notice, "relay notice");
            }
            _ => {}
        }
    }
    Ok(None)
}
