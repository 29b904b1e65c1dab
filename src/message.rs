//! NIP-01 wire messages exchanged with relays.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{event::Event, filter::QueryDescriptor};

/// Message received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// `["EVENT", sub_id, event]`
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    /// `["EOSE", sub_id]`: all stored events for the subscription were sent.
    EndOfStoredEvents { subscription_id: String },
    /// `["NOTICE", message]`
    Notice { message: String },
    /// `["AUTH", challenge]`
    Auth { challenge: String },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["CLOSED", sub_id, message]`: the relay ended the subscription.
    Closed {
        subscription_id: String,
        message: String,
    },
}

/// A relay message that could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a non-empty array")]
    NotArray,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("{kind} message missing {field}")]
    Missing {
        kind: &'static str,
        field: &'static str,
    },
    #[error("malformed event: {0}")]
    Event(serde_json::Error),
}

impl RelayMessage {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let val: Value = serde_json::from_str(text)?;
        let arr = val.as_array().ok_or(ProtocolError::NotArray)?;
        let ty = arr
            .first()
            .and_then(|v| v.as_str())
            .ok_or(ProtocolError::NotArray)?;
        let str_at = |kind: &'static str, idx: usize, field: &'static str| {
            arr.get(idx)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or(ProtocolError::Missing { kind, field })
        };
        match ty {
            "EVENT" => {
                let subscription_id = str_at("EVENT", 1, "subscription id")?;
                let raw = arr.get(2).ok_or(ProtocolError::Missing {
                    kind: "EVENT",
                    field: "event",
                })?;
                let event = Event::deserialize(raw).map_err(ProtocolError::Event)?;
                Ok(Self::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "EOSE" => Ok(Self::EndOfStoredEvents {
                subscription_id: str_at("EOSE", 1, "subscription id")?,
            }),
            "NOTICE" => Ok(Self::Notice {
                message: str_at("NOTICE", 1, "message")?,
            }),
            "AUTH" => Ok(Self::Auth {
                challenge: str_at("AUTH", 1, "challenge")?,
            }),
            "OK" => Ok(Self::Ok {
                event_id: str_at("OK", 1, "event id")?,
                accepted: arr
                    .get(2)
                    .and_then(|v| v.as_bool())
                    .ok_or(ProtocolError::Missing {
                        kind: "OK",
                        field: "status",
                    })?,
                message: arr
                    .get(3)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: str_at("CLOSED", 1, "subscription id")?,
                message: arr
                    .get(2)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Subscription the message belongs to, if any. Notices, auth challenges
    /// and acknowledgements are connection-level.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Event {
                subscription_id, ..
            }
            | Self::EndOfStoredEvents { subscription_id }
            | Self::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            Self::Notice { .. } | Self::Auth { .. } | Self::Ok { .. } => None,
        }
    }
}

/// Message sent to a relay.
#[derive(Debug, Clone, Copy)]
pub enum ClientMessage<'a> {
    Req {
        subscription_id: &'a str,
        filters: &'a [QueryDescriptor],
    },
    Close {
        subscription_id: &'a str,
    },
}

impl ClientMessage<'_> {
    /// Encode as a text frame.
    pub fn to_json(&self) -> String {
        match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![
                    Value::String("REQ".into()),
                    Value::String((*subscription_id).into()),
                ];
                arr.extend(filters.iter().map(|f| Value::Object(f.to_filter())));
                Value::Array(arr).to_string()
            }
            Self::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id]).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::event;
    use serde_json::json;

    #[test]
    fn parses_every_variant() {
        let ev = event("aa11", 3);
        let msg = RelayMessage::parse(&json!(["EVENT", "s1", ev]).to_string()).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Event {
                subscription_id: "s1".into(),
                event: Box::new(ev),
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","s1"]"#).unwrap(),
            RelayMessage::EndOfStoredEvents {
                subscription_id: "s1".into()
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice {
                message: "slow down".into()
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"["AUTH","chal"]"#).unwrap(),
            RelayMessage::Auth {
                challenge: "chal".into()
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"["OK","ee",false,"blocked: spam"]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "ee".into(),
                accepted: false,
                message: "blocked: spam".into()
            }
        );
        assert_eq!(
            RelayMessage::parse(r#"["CLOSED","s1","auth-required: login"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: "s1".into(),
                message: "auth-required: login".into()
            }
        );
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(matches!(
            RelayMessage::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            RelayMessage::parse(r#"{"a":1}"#),
            Err(ProtocolError::NotArray)
        ));
        assert!(matches!(
            RelayMessage::parse(r#"["PING"]"#),
            Err(ProtocolError::UnknownType(_))
        ));
        assert!(matches!(
            RelayMessage::parse(r#"["EOSE"]"#),
            Err(ProtocolError::Missing { .. })
        ));
        assert!(matches!(
            RelayMessage::parse(r#"["EVENT","s",{"id":1}]"#),
            Err(ProtocolError::Event(_))
        ));
    }

    #[test]
    fn subscription_scope() {
        let eose = RelayMessage::parse(r#"["EOSE","s9"]"#).unwrap();
        assert_eq!(eose.subscription_id(), Some("s9"));
        let notice = RelayMessage::parse(r#"["NOTICE","hi"]"#).unwrap();
        assert_eq!(notice.subscription_id(), None);
    }

    #[test]
    fn encodes_req_and_close() {
        let filters = [QueryDescriptor::new().kind(1).limit(2)];
        let req = ClientMessage::Req {
            subscription_id: "abc",
            filters: &filters,
        };
        let v: Value = serde_json::from_str(&req.to_json()).unwrap();
        assert_eq!(v, json!(["REQ", "abc", {"kinds": [1], "limit": 2}]));
        let close = ClientMessage::Close {
            subscription_id: "abc",
        };
        assert_eq!(close.to_json(), r#"["CLOSE","abc"]"#);
    }
}
