//! Boundary between the registry and the underlying message channel.
//!
//! The registry owns a session's lifecycle, not its data. Anything that can be
//! accepted, sent a [`ServerMessage`] and closed can be registered: the actix
//! WebSocket actor in production, an in-memory double in tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{ErrorCode, ServerMessage};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer or its mailbox is gone.
    #[error("transport closed")]
    Closed,

    #[error("transport I/O failure: {0}")]
    Io(String),

    #[error("transport operation timed out")]
    Timeout,
}

/// Why a session is being closed. Lets the peer distinguish eviction from a
/// normal hang-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client or handler initiated
    Normal,
    /// Evicted by the staleness sweep
    Timeout,
    /// A heartbeat could not be delivered
    HeartbeatFailed,
    /// The server is stopping
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::Timeout => "timeout",
            CloseReason::HeartbeatFailed => "heartbeat_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Error to send the peer before the close frame, if any.
    pub fn notice(self) -> Option<ServerMessage> {
        match self {
            CloseReason::Normal => None,
            CloseReason::Timeout => Some(ServerMessage::error(ErrorCode::Timeout)),
            CloseReason::HeartbeatFailed => Some(ServerMessage::error(ErrorCode::ConnectionError)),
            CloseReason::Shutdown => Some(ServerMessage::error_with(
                ErrorCode::ConnectionError,
                "Server is shutting down. Please reconnect later.",
                serde_json::Value::Null,
            )),
        }
    }
}

/// A bidirectional message channel whose lifecycle the registry manages.
///
/// Every method may suspend on network I/O. The registry never calls them while
/// holding its lock. `close` must tolerate being called on an already-closed
/// channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn accept(&self) -> Result<(), TransportError>;

    async fn send(&self, message: &ServerMessage) -> Result<(), TransportError>;

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError>;
}
