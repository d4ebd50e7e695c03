//! In-memory transport double shared by the registry and monitor tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::transport::{CloseReason, Transport, TransportError};
use crate::protocol::ServerMessage;

#[derive(Default)]
pub struct MockTransport {
    accepted: AtomicBool,
    closed: AtomicBool,
    send_started: AtomicBool,
    fail_accept: AtomicBool,
    fail_send: AtomicBool,
    fail_close: AtomicBool,
    panic_on_close: AtomicBool,
    accept_delay: Option<Duration>,
    send_delay: Option<Duration>,
    sent: Mutex<Vec<ServerMessage>>,
    close_reasons: Mutex<Vec<CloseReason>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_accept_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            accept_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn with_send_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            send_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn fail_accept(&self, fail: bool) {
        self.fail_accept.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn panic_on_close(&self, panic: bool) {
        self.panic_on_close.store(panic, Ordering::SeqCst);
    }

    pub fn was_accepted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send_started(&self) -> bool {
        self.send_started.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<ServerMessage> {
        self.sent.lock().clone()
    }

    pub fn close_reasons(&self) -> Vec<CloseReason> {
        self.close_reasons.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn accept(&self) -> Result<(), TransportError> {
        if let Some(delay) = self.accept_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_accept.load(Ordering::SeqCst) {
            return Err(TransportError::Io("handshake refused".to_string()));
        }
        self.accepted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        self.send_started.store(true, Ordering::SeqCst);
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        if self.panic_on_close.load(Ordering::SeqCst) {
            panic!("transport close panicked");
        }
        self.close_reasons.lock().push(reason);
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Io("close refused".to_string()));
        }
        Ok(())
    }
}
