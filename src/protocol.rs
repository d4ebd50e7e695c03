//! # WebSocket Message Protocol
//!
//! JSON messages exchanged over `/ws`. Every message carries a `type` tag.
//!
//! ## Message Format:
//! - **Server → Client**: `connected`, `heartbeat`, `error`
//! - **Client → Server**: `heartbeat`; any other text or binary frame is application
//!   data owned by the speech/chat collaborators and is only counted here
//!
//! ## Error codes:
//! Errors sent to the peer carry a numeric code so a client can tell the three
//! conditions it must react to differently:
//! - `1003 rate_limit`: the server is at capacity, retry later
//! - `1002 timeout`: the session was evicted for missing heartbeats, reconnect
//! - `1004 server_error`: the server failed internally

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric error codes sent to WebSocket peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConnectionError,
    InvalidMessage,
    Timeout,
    RateLimit,
    ServerError,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::ConnectionError => 1000,
            ErrorCode::InvalidMessage => 1001,
            ErrorCode::Timeout => 1002,
            ErrorCode::RateLimit => 1003,
            ErrorCode::ServerError => 1004,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConnectionError => "connection_error",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RateLimit => "rate_limit",
            ErrorCode::ServerError => "server_error",
        }
    }

    /// Default human-readable message for this code.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::ConnectionError => "Connection error. Please reconnect.",
            ErrorCode::InvalidMessage => "Invalid message format.",
            ErrorCode::Timeout => "Connection timed out.",
            ErrorCode::RateLimit => "Connection limit exceeded. Please retry later.",
            ErrorCode::ServerError => "Internal server error.",
        }
    }
}

/// Messages sent from the server to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The session was admitted
    Connected { session_id: String },

    /// Liveness signal; distinct from any data message
    Heartbeat { timestamp: i64 },

    /// Error notification, usually followed by a close frame
    Error {
        code: u16,
        kind: String,
        message: String,
        #[serde(default)]
        details: Value,
    },
}

impl ServerMessage {
    pub fn heartbeat() -> Self {
        ServerMessage::Heartbeat {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self::error_with(code, code.default_message(), Value::Null)
    }

    pub fn error_with(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        ServerMessage::Error {
            code: code.as_u16(),
            kind: code.as_str().to_string(),
            message: message.into(),
            details,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages the server understands from a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Client-initiated heartbeat; answered with a server heartbeat
    Heartbeat {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Result of classifying an inbound text frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Control(ClientMessage),
    /// Application payload for the speech/chat collaborators
    Data,
    /// Not JSON at all
    Malformed(String),
}

/// Classify an inbound text frame.
///
/// Well-formed JSON with an unknown `type` is application data, not an error;
/// only text that is not JSON at all is malformed.
pub fn classify(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return Inbound::Malformed(err.to_string()),
    };

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(msg) => Inbound::Control(msg),
        Err(_) => Inbound::Data,
    }
}
