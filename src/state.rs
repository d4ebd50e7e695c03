//! # Application State Management
//!
//! Shared state handed to every HTTP request handler and WebSocket actor.
//!
//! ## Arc<Lock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers hold a reference)
//! - **Lock**: Thread-safe access to the data that changes
//! - **T**: The actual data type being protected
//!
//! The connection registry and monitor counters manage their own locking, so they
//! are shared as plain `Arc`s. Configuration never changes after startup and needs
//! no lock at all.

use crate::config::AppConfig;
use crate::connection::{ConnectionRegistry, MonitorStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning copies the `Arc` pointers, not the data behind them
/// - **Instant**: A point in time (for measuring uptime)
#[derive(Clone)]
pub struct AppState {
    /// Configuration, fixed at startup
    pub config: Arc<AppConfig>,

    /// HTTP request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Every admitted WebSocket session
    pub registry: Arc<ConnectionRegistry>,

    /// Counters published by the heartbeat monitor
    pub monitor_stats: Arc<MonitorStats>,

    pub start_time: Instant,
}

/// Performance metrics collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count**: Total requests processed (for load monitoring)
/// - **error_count**: Total errors (for reliability monitoring)
/// - **endpoint_metrics**: Per-endpoint statistics (for performance optimization)
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub slow_request_count: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState around the already-constructed registry.
    ///
    /// The registry and monitor are built by `main` first because the monitor
    /// task needs its own handle to the same registry.
    pub fn new(
        config: AppConfig,
        registry: Arc<ConnectionRegistry>,
        monitor_stats: Arc<MonitorStats>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            monitor_stats,
            start_time: Instant::now(),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /health")
    /// - **duration_ms**: How long the request took to process (in milliseconds)
    /// - **is_error**: Whether this request resulted in an error
    /// - **is_slow**: Whether it crossed the latency warning threshold
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool, is_slow: bool) {
        let mut metrics = self.metrics.write();

        if is_slow {
            metrics.slow_request_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones the data so we don't hold the lock while serializing the response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state(config: AppConfig) -> AppState {
    use crate::connection::{HeartbeatMonitor, RegistryConfig};

    let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::from(&config.websocket)));
    let monitor = HeartbeatMonitor::new(registry.clone(), &config.websocket);
    AppState::new(config, registry, monitor.stats())
}
