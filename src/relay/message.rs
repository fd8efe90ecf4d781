//! NIP-01/NIP-77 JSON wire frames. Negentropy payloads are hex strings
//! nested inside the JSON array, per NIP-77.

use serde_json::{json, Value};

use crate::event::{Event, Filter};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("unknown frame label: {0}")]
    UnknownLabel(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Messages this crate sends to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    NegOpen { sub_id: String, filter: Filter, initial_msg_hex: String },
    NegMsg { sub_id: String, msg_hex: String },
    NegClose { sub_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req { sub_id, filters } => {
                let mut arr = vec![json!("REQ"), json!(sub_id)];
                arr.extend(filters.iter().map(|f| serde_json::to_value(f)).collect::<Result<Vec<_>, _>>()?);
                Value::Array(arr)
            }
            ClientMessage::Close { sub_id } => json!(["CLOSE", sub_id]),
            ClientMessage::NegOpen { sub_id, filter, initial_msg_hex } => {
                json!(["NEG-OPEN", sub_id, filter, initial_msg_hex])
            }
            ClientMessage::NegMsg { sub_id, msg_hex } => json!(["NEG-MSG", sub_id, msg_hex]),
            ClientMessage::NegClose { sub_id } => json!(["NEG-CLOSE", sub_id]),
        };
        Ok(value.to_string())
    }
}

/// Messages received from a relay.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Ok { event_id: String, success: bool, message: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
    NegMsg { sub_id: String, msg_hex: String },
    NegErr { sub_id: String, message: String },
    Auth { challenge: String },
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let arr = value
            .as_array()
            .ok_or(ProtocolError::Malformed("frame is not a JSON array"))?;
        let label = arr
            .first()
            .and_then(Value::as_str)
            .ok_or(ProtocolError::Malformed("missing frame label"))?;

        let get_str = |i: usize| -> Result<String, ProtocolError> {
            arr.get(i)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or(ProtocolError::Malformed("expected string field"))
        };

        match label {
            "EVENT" => {
                let sub_id = get_str(1)?;
                let event: Event = serde_json::from_value(
                    arr.get(2)
                        .cloned()
                        .ok_or(ProtocolError::Malformed("missing event body"))?,
                )?;
                Ok(RelayMessage::Event { sub_id, event })
            }
            "EOSE" => Ok(RelayMessage::Eose { sub_id: get_str(1)? }),
            "OK" => {
                let event_id = get_str(1)?;
                let success = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or(ProtocolError::Malformed("expected bool success"))?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok { event_id, success, message })
            }
            "CLOSED" => {
                let sub_id = get_str(1)?;
                let message = arr.get(2).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Closed { sub_id, message })
            }
            "NOTICE" => Ok(RelayMessage::Notice { message: get_str(1)? }),
            "NEG-MSG" => Ok(RelayMessage::NegMsg {
                sub_id: get_str(1)?,
                msg_hex: get_str(2)?,
            }),
            "NEG-ERR" => Ok(RelayMessage::NegErr {
                sub_id: get_str(1)?,
                message: get_str(2)?,
            }),
            "AUTH" => Ok(RelayMessage::Auth { challenge: get_str(1)? }),
            other => Err(ProtocolError::UnknownLabel(other.to_string())),
        }
    }

    /// `OK` message prefixes per NIP-20, used to classify upload results.
    pub fn ok_reason(message: &str) -> &'static str {
        const PREFIXES: &[(&str, &str)] = &[
            ("duplicate:", "duplicate"),
            ("rate-limited:", "rate_limited"),
            ("blocked:", "blocked"),
            ("invalid:", "invalid"),
            ("error:", "error"),
            ("pow:", "pow"),
            ("restricted:", "restricted"),
            ("auth-required:", "auth_required"),
        ];
        PREFIXES
            .iter()
            .find(|(prefix, _)| message.starts_with(prefix))
            .map(|(_, reason)| *reason)
            .unwrap_or("unknown")
    }
}
