//! Client-facing frames.
//!
//! Frames are JSON objects tagged by a `type` field. Clients send
//! [`ClientRequest`]s; the gateway answers and pushes [`ServerEvent`]s.

use serde::{Deserialize, Serialize};

use crate::callsign::ConversationKey;

/// Error codes carried by [`ServerEvent::Error`].
pub mod error_codes {
    /// Frame could not be decoded.
    pub const INVALID_FRAME: u16 = 1001;
    /// Request requires a login first.
    pub const AUTH_REQUIRED: u16 = 1002;
    /// Login was rejected.
    pub const AUTH_FAILED: u16 = 1003;
    /// Message could not be sent upstream.
    pub const SEND_FAILED: u16 = 1004;
    /// Request is not valid in the current state.
    pub const INVALID_REQUEST: u16 = 1005;
}

/// Requests sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Authenticate as a callsign.
    Login { callsign: String, passcode: String },

    /// Send a message upstream.
    SendMessage {
        /// Recipient callsign.
        to: String,
        /// Message text.
        text: String,
        /// Send as a specific SSID of the logged-in callsign.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },

    /// Application-level keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// One hop of a display route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    pub callsign: String,
}

impl RouteHop {
    /// Create a hop.
    #[must_use]
    pub fn new(callsign: impl Into<String>) -> Self {
        Self {
            callsign: callsign.into(),
        }
    }
}

/// A message pushed to a client, live or from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub from: String,
    pub to: String,
    pub text: String,
    pub route: Vec<RouteHop>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Replayed from the store rather than received live.
    pub historical: bool,
}

/// Delivery status of a locally originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Written to the upstream link.
    Sent,
    /// Acknowledged by the remote station.
    Delivered,
    /// Rejected by the remote station.
    Rejected,
}

/// Status change of a locally originated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub conversation_key: ConversationKey,
    pub message_id: String,
    pub status: DeliveryStatus,
    pub retry_count: u32,
}

/// A retransmission of an already received message arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateNotice {
    pub conversation_key: ConversationKey,
    pub message_id: String,
    pub retry_count: u32,
}

/// Events sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Login accepted.
    LoggedIn {
        callsign: String,
        /// Number of stored messages not yet delivered.
        pending: usize,
    },

    /// Inbound or historical message.
    Message(PushMessage),

    /// Status of a message this station sent.
    Status(StatusUpdate),

    /// Duplicate of an earlier inbound message.
    #[serde(rename = "retry-received")]
    RetryReceived(DuplicateNotice),

    /// Request failed.
    Error { code: u16, message: String },

    /// Answer to [`ClientRequest::Ping`].
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Create an error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Stable event name, matching the `type` tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::LoggedIn { .. } => "logged_in",
            ServerEvent::Message(_) => "message",
            ServerEvent::Status(_) => "status",
            ServerEvent::RetryReceived(_) => "retry-received",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong { .. } => "pong",
        }
    }
}
