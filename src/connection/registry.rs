//! # Connection Registry
//!
//! Owns the authoritative set of admitted WebSocket sessions: admission control,
//! per-session heartbeat timestamps and teardown.
//!
//! ## Locking discipline:
//! All bookkeeping lives in one map behind one `parking_lot::Mutex`, so a session is
//! either fully present or fully absent; there are no parallel maps to fall out of
//! step. The lock is only held for map reads and writes. Transport I/O (`accept`,
//! `send`, `close`) always happens after the guard is dropped, and the result is
//! reconciled under a fresh lock.
//!
//! ## Admission:
//! `connect` inserts a `Connecting` reservation in the same critical section as the
//! capacity check, so two racing connects can never both take the last slot. The
//! reservation counts against capacity but is invisible to `is_connected`,
//! `active_count` and the staleness sweep until the handshake completes.
//!
//! ## Generations:
//! Every reservation gets a registry-unique generation number. Code that reconciles
//! after I/O only touches the generation it observed, so a session that was
//! disconnected and reconnected under the same id in the meantime is left alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::error::ConnectionError;
use super::transport::{CloseReason, Transport, TransportError};
use crate::config::WebSocketConfig;
use crate::protocol::ServerMessage;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Admission slot reserved, handshake in flight
    Connecting,
    Connected,
}

/// Settings the registry is built with. Fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_connections: usize,
    pub connection_timeout: Duration,
}

impl From<&WebSocketConfig> for RegistryConfig {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            connection_timeout: config.connection_timeout(),
        }
    }
}

struct Session {
    transport: Arc<dyn Transport>,
    state: SessionState,
    generation: u64,
    last_heartbeat: Instant,
}

/// Everything guarded by the registry lock.
#[derive(Default)]
struct Sessions {
    by_id: HashMap<SessionId, Session>,
    connected: usize,
    next_generation: u64,
}

impl Sessions {
    fn reserve(&mut self, id: &str, transport: Arc<dyn Transport>, now: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.by_id.insert(
            id.to_string(),
            Session {
                transport,
                state: SessionState::Connecting,
                generation,
                last_heartbeat: now,
            },
        );
        generation
    }

    /// Turn a reservation into an admitted session. False if the reservation is gone.
    fn promote(&mut self, id: &str, generation: u64, now: Instant) -> bool {
        match self.by_id.get_mut(id) {
            Some(session)
                if session.generation == generation && session.state == SessionState::Connecting =>
            {
                session.state = SessionState::Connected;
                session.last_heartbeat = now;
                self.connected += 1;
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, id: &str, generation: u64) {
        let matches = self
            .by_id
            .get(id)
            .is_some_and(|s| s.generation == generation && s.state == SessionState::Connecting);
        if matches {
            self.by_id.remove(id);
        }
    }

    /// Remove an admitted session, optionally only a specific generation of it.
    fn remove_connected(&mut self, id: &str, generation: Option<u64>) -> Option<Session> {
        let matches = self.by_id.get(id).is_some_and(|s| {
            s.state == SessionState::Connected && generation.map_or(true, |g| g == s.generation)
        });
        if !matches {
            return None;
        }
        self.connected -= 1;
        self.by_id.remove(id)
    }

    fn connected(&self, id: &str) -> Option<&Session> {
        self.by_id
            .get(id)
            .filter(|s| s.state == SessionState::Connected)
    }
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    rejected_capacity: AtomicU64,
    evicted_stale: AtomicU64,
    heartbeat_failures: AtomicU64,
    close_failures: AtomicU64,
}

/// Point-in-time view of the registry for health and metrics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub pending: usize,
    pub capacity: usize,
    pub admitted_total: u64,
    pub rejected_capacity_total: u64,
    pub evicted_stale_total: u64,
    pub heartbeat_failures_total: u64,
    pub close_failures_total: u64,
}

/// Tracks every admitted session. One instance per server, shared through `Arc`.
pub struct ConnectionRegistry {
    sessions: Mutex<Sessions>,
    max_connections: usize,
    connection_timeout: Duration,
    counters: Counters,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: Mutex::new(Sessions::default()),
            max_connections: config.max_connections,
            connection_timeout: config.connection_timeout,
            counters: Counters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Admit a new session.
    ///
    /// ## Returns:
    /// - **Ok(true)**: the handshake completed and the session is registered
    /// - **Ok(false)**: the registry is full; tell the peer to retry later
    /// - **Err(AlreadyConnected)**: the id is already registered or mid-handshake
    /// - **Err(HandshakeFailed)**: `accept` failed or did not finish within the
    ///   connection timeout; the slot is released
    pub async fn connect(
        &self,
        id: impl Into<SessionId>,
        transport: Arc<dyn Transport>,
    ) -> Result<bool, ConnectionError> {
        let id = id.into();

        let generation = {
            let mut sessions = self.sessions.lock();
            if sessions.by_id.len() >= self.max_connections {
                None
            } else if sessions.by_id.contains_key(&id) {
                return Err(ConnectionError::AlreadyConnected(id));
            } else {
                Some(sessions.reserve(&id, transport.clone(), Instant::now()))
            }
        };

        let Some(generation) = generation else {
            self.counters.rejected_capacity.fetch_add(1, Ordering::Relaxed);
            warn!(
                session_id = %id,
                max_connections = self.max_connections,
                "Connection limit reached"
            );
            return Ok(false);
        };

        let handshake = match tokio::time::timeout(self.connection_timeout, transport.accept()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        let outcome = {
            let mut sessions = self.sessions.lock();
            match handshake {
                Ok(()) => {
                    if sessions.promote(&id, generation, Instant::now()) {
                        Ok(sessions.connected)
                    } else {
                        Err(TransportError::Closed)
                    }
                }
                Err(err) => {
                    sessions.release(&id, generation);
                    Err(err)
                }
            }
        };

        match outcome {
            Ok(active) => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                info!("Client {} connected. Active connections: {}", id, active);
                Ok(true)
            }
            Err(source) => {
                warn!(session_id = %id, error = %source, "Handshake failed, releasing slot");
                self.close_transport(&id, &transport, CloseReason::Normal).await;
                Err(ConnectionError::HandshakeFailed { id, source })
            }
        }
    }

    /// Disconnect a session with a normal close. See [`Self::disconnect_with`].
    pub async fn disconnect(&self, id: &str) -> bool {
        self.disconnect_with(id, CloseReason::Normal).await
    }

    /// Remove a session and close its transport.
    ///
    /// Idempotent: returns false and does nothing if the id is not admitted, so the
    /// handler, a failed heartbeat and the monitor may all race to call it. The
    /// entry is removed before the transport is closed; a failing close is logged
    /// and never undoes the removal.
    pub async fn disconnect_with(&self, id: &str, reason: CloseReason) -> bool {
        self.evict(id, None, reason).await
    }

    /// Send a liveness signal to the peer.
    ///
    /// On success the staleness clock is reset and `Ok(true)` is returned. A failed
    /// send is taken as proof the peer is gone: the session is disconnected and
    /// `Ok(false)` is returned. `Ok(false)` is also returned if the session was
    /// removed by someone else while the send was in flight.
    pub async fn send_heartbeat(&self, id: &str) -> Result<bool, ConnectionError> {
        let (transport, generation) = {
            let sessions = self.sessions.lock();
            match sessions.connected(id) {
                Some(session) => (session.transport.clone(), session.generation),
                None => return Err(ConnectionError::NotConnected(id.to_string())),
            }
        };

        match transport.send(&ServerMessage::heartbeat()).await {
            Ok(()) => Ok(self.refresh(id, generation, Instant::now())),
            Err(err) => {
                self.counters.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
                error!("Heartbeat failed for client {}: {}", id, err);
                self.evict(id, Some(generation), CloseReason::HeartbeatFailed)
                    .await;
                Ok(false)
            }
        }
    }

    /// Record inbound liveness (a message or pong arrived) without sending anything.
    pub fn touch(&self, id: &str) -> Result<(), ConnectionError> {
        let mut sessions = self.sessions.lock();
        match sessions.by_id.get_mut(id) {
            Some(session) if session.state == SessionState::Connected => {
                session.last_heartbeat = Instant::now();
                Ok(())
            }
            _ => Err(ConnectionError::NotConnected(id.to_string())),
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.sessions.lock().connected(id).is_some()
    }

    pub fn connection_state(&self, id: &str) -> Option<SessionState> {
        self.sessions.lock().by_id.get(id).map(|s| s.state)
    }

    pub fn last_heartbeat(&self, id: &str) -> Option<Instant> {
        self.sessions.lock().connected(id).map(|s| s.last_heartbeat)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().connected
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .lock()
            .by_id
            .iter()
            .filter(|(_, s)| s.state == SessionState::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Evict every admitted session whose last heartbeat is more than the
    /// connection timeout before `now`.
    ///
    /// Staleness is decided and the entries removed in a single critical section,
    /// so a session admitted or refreshed after that point cannot be evicted by
    /// this sweep. Transports are closed afterwards, concurrently.
    pub async fn sweep_stale(&self, now: Instant) -> Vec<SessionId> {
        let stale: Vec<(SessionId, Session)> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<SessionId> = sessions
                .by_id
                .iter()
                .filter(|(_, s)| {
                    s.state == SessionState::Connected
                        && now.saturating_duration_since(s.last_heartbeat) > self.connection_timeout
                })
                .map(|(id, _)| id.clone())
                .collect();

            ids.into_iter()
                .filter_map(|id| sessions.remove_connected(&id, None).map(|s| (id, s)))
                .collect()
        };

        if stale.is_empty() {
            return Vec::new();
        }

        self.counters
            .evicted_stale
            .fetch_add(stale.len() as u64, Ordering::Relaxed);

        let closing: Vec<(SessionId, Arc<dyn Transport>)> = stale
            .into_iter()
            .map(|(id, session)| {
                warn!(
                    session_id = %id,
                    idle_secs = now.saturating_duration_since(session.last_heartbeat).as_secs(),
                    timeout_secs = self.connection_timeout.as_secs(),
                    "Disconnecting stale client"
                );
                (id, session.transport)
            })
            .collect();

        self.close_detached(&closing, CloseReason::Timeout).await;

        closing.into_iter().map(|(id, _)| id).collect()
    }

    /// Disconnect every admitted session. Used on shutdown.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<(SessionId, Arc<dyn Transport>)> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<SessionId> = sessions
                .by_id
                .iter()
                .filter(|(_, s)| s.state == SessionState::Connected)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove_connected(&id, None).map(|s| (id, s.transport)))
                .collect()
        };

        self.close_detached(&drained, reason).await;

        info!(count = drained.len(), reason = reason.as_str(), "Closed all WebSocket connections");
        drained.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let (active, pending) = {
            let sessions = self.sessions.lock();
            (sessions.connected, sessions.by_id.len() - sessions.connected)
        };

        RegistryStats {
            active,
            pending,
            capacity: self.max_connections,
            admitted_total: self.counters.admitted.load(Ordering::Relaxed),
            rejected_capacity_total: self.counters.rejected_capacity.load(Ordering::Relaxed),
            evicted_stale_total: self.counters.evicted_stale.load(Ordering::Relaxed),
            heartbeat_failures_total: self.counters.heartbeat_failures.load(Ordering::Relaxed),
            close_failures_total: self.counters.close_failures.load(Ordering::Relaxed),
        }
    }

    fn refresh(&self, id: &str, generation: u64, now: Instant) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.by_id.get_mut(id) {
            Some(session)
                if session.generation == generation && session.state == SessionState::Connected =>
            {
                session.last_heartbeat = now;
                true
            }
            _ => false,
        }
    }

    async fn evict(&self, id: &str, generation: Option<u64>, reason: CloseReason) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            sessions
                .remove_connected(id, generation)
                .map(|session| (session, sessions.connected))
        };

        let Some((session, active)) = removed else {
            debug!(session_id = %id, "Disconnect ignored, session not connected");
            return false;
        };

        self.close_transport(id, &session.transport, reason).await;
        info!(
            reason = reason.as_str(),
            "Client {} disconnected. Active connections: {}", id, active
        );
        true
    }

    /// Close already-removed transports concurrently, each in its own task, so a
    /// close that panics cannot abandon the others.
    async fn close_detached(&self, closing: &[(SessionId, Arc<dyn Transport>)], reason: CloseReason) {
        let tasks = closing.iter().map(|(_, transport)| {
            let transport = transport.clone();
            tokio::spawn(async move { transport.close(reason).await })
        });
        let results = join_all(tasks).await;

        for ((id, _), result) in closing.iter().zip(results) {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.counters.close_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Error closing connection for client {}: {}", id, err);
                }
                Err(err) => {
                    self.counters.close_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Closing connection for client {} panicked: {}", id, err);
                }
            }
        }
    }

    async fn close_transport(&self, id: &str, transport: &Arc<dyn Transport>, reason: CloseReason) {
        if let Err(err) = transport.close(reason).await {
            self.counters.close_failures.fetch_add(1, Ordering::Relaxed);
            error!("Error closing connection for client {}: {}", id, err);
        }
    }
}
