use thiserror::Error;

use super::transport::TransportError;

/// Invalid-state conditions reported by the connection registry.
///
/// Capacity rejection and heartbeat send failures are not errors; they are
/// reported as `Ok(false)` so callers can answer the peer with "retry later"
/// or treat the session as dead.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The id is already admitted (or being admitted). The caller reused an id.
    #[error("session {0} is already connected")]
    AlreadyConnected(String),

    /// No admitted session has this id.
    #[error("session {0} is not connected")]
    NotConnected(String),

    /// The transport handshake failed or timed out; the reservation was released.
    #[error("handshake for session {id} failed: {source}")]
    HandshakeFailed {
        id: String,
        #[source]
        source: TransportError,
    },
}

impl ConnectionError {
    pub fn session_id(&self) -> &str {
        match self {
            ConnectionError::AlreadyConnected(id) | ConnectionError::NotConnected(id) => id,
            ConnectionError::HandshakeFailed { id, .. } => id,
        }
    }
}
