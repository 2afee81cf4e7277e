//! WebSocket wire protocol.
//!
//! Every frame is a JSON envelope `{type, request_id?, payload}`. Commands
//! and their results pair up by `request_id` per session; events carry the
//! room seq so clients can resume from where they stopped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{CommandResult, EventRecord, Payload};

// =============================================================================
// Client -> server
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        request_id: Option<String>,
        payload: SubscribePayload,
    },
    Command {
        #[serde(default)]
        request_id: Option<String>,
        payload: CommandPayload,
    },
    Ping {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribePayload {
    pub room_id: String,
    /// Largest seq the client has already seen; 0 for a fresh join.
    #[serde(default)]
    pub last_seq: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandPayload {
    /// Minted server-side when missing, so forgetful clients still get
    /// idempotency.
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub room_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub last_seen_seq: Option<i64>,
    #[serde(default)]
    pub data: Value,
}

// =============================================================================
// Server -> client
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: SubscribedPayload,
    },
    Event {
        payload: WireEvent,
    },
    CommandResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: CommandResult,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: ErrorPayload,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        payload: Value,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribedPayload {
    pub status: &'static str,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    /// One of `bad_request`, `forbidden`, `rate_limited`, `internal`.
    pub code: &'static str,
    pub message: String,
}

/// A projected event as the client sees it.
#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
    pub room_id: String,
    pub seq: i64,
    pub event_id: String,
    pub event_type: String,
    pub actor_user_id: String,
    pub payload: Payload,
    pub server_ts: i64,
}

impl From<EventRecord> for WireEvent {
    fn from(event: EventRecord) -> Self {
        Self {
            room_id: event.room_id.to_string(),
            seq: event.seq,
            event_id: event.event_id,
            event_type: event.event_type,
            actor_user_id: event.actor_user_id.to_string(),
            payload: event.payload,
            server_ts: event.server_ts,
        }
    }
}

impl ServerMessage {
    pub fn error(request_id: Option<String>, code: &'static str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id,
            payload: ErrorPayload {
                code,
                message: message.into(),
            },
        }
    }
}
