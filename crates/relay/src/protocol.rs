//! Wire format for reconciliation sessions.
//!
//! One JSON array per line: `[type, "N", fields...]`. Binary payloads are hex;
//! filters, event lists and id lists are JSON documents embedded as strings.

use nostr::nip77::ID_SIZE;
use nostr::{Event, Filter};
use serde_json::{Value, json};

use crate::session::SyncError;

/// Protocol line a dialer sends before the first message.
pub const PROTOCOL_NAME: &str = "/openagents/negentropy/1.0.0";

const SUBSCRIPTION_ID: &str = "N";

#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    Open {
        filter: Filter,
        id_size: usize,
        message: Vec<u8>,
    },
    Msg(Vec<u8>),
    /// Events as received. Each element is parsed on its own so one bad event
    /// does not invalidate the rest.
    Have(Vec<Value>),
    Need(Vec<String>),
    Err(String),
    Close,
}

impl SyncMessage {
    pub fn have(events: &[Event]) -> Self {
        Self::Have(events.iter().map(|event| json!(event)).collect())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "NEG-OPEN",
            Self::Msg(_) => "NEG-MSG",
            Self::Have(_) => "NEG-HAVE",
            Self::Need(_) => "NEG-NEED",
            Self::Err(_) => "NEG-ERR",
            Self::Close => "NEG-CLOSE",
        }
    }

    /// One line, without the trailing newline.
    pub fn encode(&self) -> Result<String, SyncError> {
        let kind = self.kind();
        let frame = match self {
            Self::Open {
                filter,
                id_size,
                message,
            } => json!([
                kind,
                SUBSCRIPTION_ID,
                serde_json::to_string(filter)?,
                id_size.to_string(),
                hex::encode(message)
            ]),
            Self::Msg(message) => json!([kind, SUBSCRIPTION_ID, hex::encode(message)]),
            Self::Have(events) => json!([kind, SUBSCRIPTION_ID, serde_json::to_string(events)?]),
            Self::Need(ids) => json!([kind, SUBSCRIPTION_ID, serde_json::to_string(ids)?]),
            Self::Err(reason) => json!([kind, SUBSCRIPTION_ID, reason]),
            Self::Close => json!([kind, SUBSCRIPTION_ID]),
        };
        Ok(serde_json::to_string(&frame)?)
    }

    pub fn decode(line: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|error| malformed(format!("not JSON: {error}")))?;
        let fields = value
            .as_array()
            .ok_or_else(|| malformed("expected a JSON array"))?;
        let kind = fields
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing message type"))?;
        fields
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(format!("{kind}: missing subscription id")))?;

        let field = |index: usize| str_field(fields, kind, index);
        let hex_field = |index: usize| {
            hex::decode(str_field(fields, kind, index)?)
                .map_err(|error| malformed(format!("{kind}: {error}")))
        };

        match kind {
            "NEG-OPEN" => {
                let filter: Filter = serde_json::from_str(field(2)?)
                    .map_err(|error| SyncError::BadFilter(error.to_string()))?;
                let id_size: usize = field(3)?
                    .parse()
                    .map_err(|_| malformed("NEG-OPEN: id size is not a number"))?;
                if id_size != ID_SIZE {
                    return Err(malformed(format!("NEG-OPEN: unsupported id size {id_size}")));
                }
                Ok(Self::Open {
                    filter,
                    id_size,
                    message: hex_field(4)?,
                })
            }
            "NEG-MSG" => Ok(Self::Msg(hex_field(2)?)),
            "NEG-HAVE" => {
                let events: Vec<Value> = serde_json::from_str(field(2)?)
                    .map_err(|error| malformed(format!("NEG-HAVE: {error}")))?;
                Ok(Self::Have(events))
            }
            "NEG-NEED" => {
                let ids: Vec<String> = serde_json::from_str(field(2)?)
                    .map_err(|error| malformed(format!("NEG-NEED: {error}")))?;
                Ok(Self::Need(ids))
            }
            "NEG-ERR" => Ok(Self::Err(field(2).unwrap_or_default().to_string())),
            "NEG-CLOSE" => Ok(Self::Close),
            other => Err(SyncError::UnknownMessageType(other.to_string())),
        }
    }
}

fn str_field<'a>(fields: &'a [Value], kind: &str, index: usize) -> Result<&'a str, SyncError> {
    fields
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(format!("{kind}: field {index} missing or not a string")))
}

fn malformed(reason: impl Into<String>) -> SyncError {
    SyncError::MalformedMessage(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_double_encoded() {
        let line = SyncMessage::Need(vec!["ab".repeat(32)]).encode().unwrap();
        let outer: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(outer[0], "NEG-NEED");
        assert_eq!(outer[1], "N");
        assert!(outer[2].is_string());

        let open = SyncMessage::Open {
            filter: Filter::new().authors(["cd".repeat(32)]),
            id_size: 32,
            message: vec![0x61, 0x00],
        }
        .encode()
        .unwrap();
        let outer: Value = serde_json::from_str(&open).unwrap();
        assert_eq!(outer[2], format!(r#"{{"authors":["{}"]}}"#, "cd".repeat(32)));
        assert_eq!(outer[3], "32");
        assert_eq!(outer[4], "6100");
        assert!(!open.contains('\n'));
    }

    #[test]
    fn decodes_every_message_type() {
        let messages = [
            SyncMessage::Open {
                filter: Filter::new().kinds([1]),
                id_size: 32,
                message: vec![0x61],
            },
            SyncMessage::Msg(vec![0x61, 0x02]),
            SyncMessage::Have(vec![json!({"id": "x"})]),
            SyncMessage::Need(vec!["00".repeat(32)]),
            SyncMessage::Err("closed".to_string()),
            SyncMessage::Close,
        ];
        for message in messages {
            let decoded = SyncMessage::decode(&message.encode().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        struct Case {
            name: &'static str,
            input: &'static str,
        }

        let cases = [
            Case {
                name: "not json",
                input: "NEG-MSG 61",
            },
            Case {
                name: "object frame",
                input: r#"{"type":"NEG-MSG"}"#,
            },
            Case {
                name: "missing subscription id",
                input: r#"["NEG-CLOSE"]"#,
            },
            Case {
                name: "bad hex",
                input: r#"["NEG-MSG","N","zz"]"#,
            },
            Case {
                name: "need is not a list",
                input: r#"["NEG-NEED","N","{}"]"#,
            },
            Case {
                name: "bad filter",
                input: r#"["NEG-OPEN","N","[1]","32","61"]"#,
            },
            Case {
                name: "foreign id size",
                input: r#"["NEG-OPEN","N","{}","16","61"]"#,
            },
        ];

        for case in cases {
            let error = SyncMessage::decode(case.input).expect_err(case.name);
            assert!(error.is_protocol(), "{}: {}", case.name, error);
        }

        assert!(matches!(
            SyncMessage::decode(r#"["NEG-PING","N"]"#),
            Err(SyncError::UnknownMessageType(kind)) if kind == "NEG-PING"
        ));
    }
}
