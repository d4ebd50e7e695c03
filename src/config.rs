//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (APP_SERVER__PORT, APP_WEBSOCKET__MAX_CONNECTIONS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Configuration is read once at startup. The connection registry and heartbeat
//! monitor copy the values they need when they are constructed, so nothing here
//! is reloadable at runtime.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: Automatically implements common traits:
///   - `Debug`: Allows printing with {:?} for debugging
///   - `Clone`: Allows making copies of the struct
///   - `Serialize`: Can convert this struct to JSON, TOML, etc.
///   - `Deserialize`: Can create this struct from JSON, TOML, etc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// WebSocket connection lifecycle settings.
///
/// ## Fields:
/// - `max_connections`: Admission ceiling; connections beyond it are told to retry later
/// - `heartbeat_interval_secs`: Period of the heartbeat monitor and of per-connection pings
/// - `connection_timeout_secs`: A session silent for longer than this is evicted
/// - `monitor_backoff_ms`: Pause after a failed monitor cycle before the next one
/// - `slow_cycle_threshold_ms`: Monitor cycles and requests slower than this are logged at warn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub monitor_backoff_ms: u64,
    pub slow_cycle_threshold_ms: u64,
}

impl WebSocketConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn monitor_backoff(&self) -> Duration {
        Duration::from_millis(self.monitor_backoff_ms)
    }

    pub fn slow_cycle_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_cycle_threshold_ms)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_connections: 5000,
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 60,
            monitor_backoff_ms: 1000,
            slow_cycle_threshold_ms: 100,
        }
    }
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8000,
            },
            websocket: WebSocketConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_WEBSOCKET__MAX_CONNECTIONS=200`: Override the admission ceiling
    /// - `APP_WEBSOCKET__CONNECTION_TIMEOUT_SECS=90`: Override the staleness timeout
    /// - `PORT=3000`: Special case for deployment platforms
    ///
    /// Nested keys use a double underscore because field names themselves contain
    /// single underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The admission ceiling allows at least one connection
    /// - The heartbeat interval is not zero (the monitor would spin)
    /// - The connection timeout is strictly longer than the heartbeat interval, otherwise
    ///   a healthy client answering every ping could still be evicted between two pings
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let ws = &self.websocket;

        if ws.max_connections == 0 {
            return Err(anyhow::anyhow!("Max connections must be greater than 0"));
        }

        if ws.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if ws.connection_timeout_secs <= ws.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Connection timeout ({}s) must be greater than the heartbeat interval ({}s)",
                ws.connection_timeout_secs,
                ws.heartbeat_interval_secs
            ));
        }

        Ok(())
    }
}
