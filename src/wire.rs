//! Relay wire message framing.
//!
//! Relay messages are JSON arrays:
//! - `["EVENT", <sub_id>, <event>]`
//! - `["EOSE", <sub_id>]`
//! - `["NOTICE", <message>]`
//! - `["OK", <event_id>, <accepted>, <message>]`
//! - `["CLOSED", <sub_id>, <message>]`
//!
//! Outbound frames are `["REQ", <sub_id>, <filter>...]`, `["CLOSE", <sub_id>]`
//! and `["EVENT", <event>]`.

use anyhow::{Context, Result};

use crate::event::Event;
use crate::filter::Filter;

/// Parsed inbound relay message.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// An event matched one of our wire subscriptions.
    Event { sub_id: String, event: Event },
    /// End of stored events — real-time events follow on this subscription.
    EndOfStoredEvents { sub_id: String },
    /// Human-readable relay notice.
    Notice { message: String },
    /// Publish acknowledgement.
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// The relay closed one of our subscriptions.
    Closed { sub_id: String, message: String },
    /// Unparseable or unrecognized message, kept for logging.
    Unknown(String),
}

/// Parse a raw relay text frame.
pub fn parse(msg: &str) -> RelayMessage {
    let parsed: serde_json::Value = match serde_json::from_str(msg) {
        Ok(v) => v,
        Err(_) => return RelayMessage::Unknown(msg.to_string()),
    };

    let arr = match parsed.as_array() {
        Some(a) => a,
        None => return RelayMessage::Unknown(msg.to_string()),
    };

    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") => {
            let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let event = match arr.get(2).cloned().map(serde_json::from_value) {
                Some(Ok(event)) => event,
                _ => return RelayMessage::Unknown(msg.to_string()),
            };
            RelayMessage::Event { sub_id, event }
        }
        Some("EOSE") => {
            let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            RelayMessage::EndOfStoredEvents { sub_id }
        }
        Some("NOTICE") => {
            let message = arr.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            RelayMessage::Notice { message }
        }
        Some("OK") => {
            let event_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
            let message = arr.get(3).and_then(|v| v.as_str()).unwrap_or("").to_string();
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            }
        }
        Some("CLOSED") => {
            let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let message = arr.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
            RelayMessage::Closed { sub_id, message }
        }
        _ => RelayMessage::Unknown(msg.to_string()),
    }
}

/// Build a `["REQ", sub_id, filter...]` frame.
pub fn req_frame(sub_id: &str, filters: &[Filter]) -> Result<String> {
    let mut arr = vec![
        serde_json::Value::from("REQ"),
        serde_json::Value::from(sub_id),
    ];
    for filter in filters {
        arr.push(serde_json::to_value(filter).context("Failed to serialize filter")?);
    }
    serde_json::to_string(&arr).context("Failed to serialize REQ frame")
}

/// Build a `["CLOSE", sub_id]` frame.
pub fn close_frame(sub_id: &str) -> String {
    serde_json::json!(["CLOSE", sub_id]).to_string()
}

/// Build an `["EVENT", event]` publish frame.
pub fn event_frame(event: &Event) -> Result<String> {
    let value = serde_json::to_value(event).context("Failed to serialize event")?;
    Ok(serde_json::json!(["EVENT", value]).to_string())
}
