//! Subscription bookkeeping for a single relay connection.

use nostr::{Event, Filter};
use serde_json::{Value, json};

/// A REQ sent to a relay, tracked so its filters can be enforced locally.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
        }
    }

    /// `["REQ", <id>, <filter>...]`
    pub fn request(&self) -> Value {
        let mut frame = vec![json!("REQ"), json!(self.id)];
        frame.extend(self.filters.iter().map(|filter| json!(filter)));
        Value::Array(frame)
    }

    /// Whether any filter of this subscription admits `event`. Relays are
    /// not trusted to honor the filter.
    pub fn accepts(&self, event: &Event) -> bool {
        self.filters.iter().any(|filter| filter.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventTemplate, finalize_event};

    #[test]
    fn request_frame_carries_every_filter() {
        let subscription = Subscription::new(
            "sub-1",
            vec![Filter::new().ids(["aa"]), Filter::new().kinds([1])],
        );
        assert_eq!(
            subscription.request(),
            json!(["REQ", "sub-1", {"ids": ["aa"]}, {"kinds": [1]}])
        );
    }

    #[test]
    fn accepts_when_any_filter_matches() {
        let event = finalize_event(
            &EventTemplate {
                created_at: 1_700_000_000,
                kind: 7,
                tags: vec![],
                content: "+".to_string(),
            },
            &[5; 32],
        )
        .unwrap();
        let other_id = "00".repeat(32);

        let narrow = Subscription::new("a", vec![Filter::new().ids([other_id.as_str()])]);
        assert!(!narrow.accepts(&event));

        let either = Subscription::new(
            "b",
            vec![Filter::new().ids([other_id.as_str()]), Filter::new().kinds([7])],
        );
        assert!(either.accepts(&event));
    }
}
