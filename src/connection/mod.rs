//! # WebSocket Connection Lifecycle
//!
//! Tracks long-lived WebSocket sessions: admission against a connection ceiling,
//! heartbeat bookkeeping, and eviction of peers that went silent.
//!
//! ## Key Components:
//! - **Registry**: the single shared set of admitted sessions (`registry.rs`)
//! - **Monitor**: background sweep that evicts stale sessions (`monitor.rs`)
//! - **Transport**: the seam to the underlying message channel (`transport.rs`)
//!
//! The registry is constructed once in `main` and handed to every WebSocket
//! handler and to the monitor as an `Arc`; there is no global instance.

pub mod error;
pub mod monitor;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::ConnectionError;
pub use monitor::{HeartbeatMonitor, MonitorStats};
pub use registry::{ConnectionRegistry, RegistryConfig, RegistryStats};
pub use transport::{CloseReason, Transport, TransportError};
