//! # Heartbeat Monitor
//!
//! Background task that sweeps the [`ConnectionRegistry`] for stale sessions once
//! per heartbeat interval.
//!
//! ## Cycle:
//! 1. Take one `Instant` for the whole cycle so every comparison uses the same clock
//! 2. Evict sessions idle for longer than the connection timeout
//! 3. Report the number of remaining connections
//! 4. Sleep until `cycle start + interval`; if the cycle overran, start the next one
//!    immediately
//!
//! ## Liveness policy:
//! The monitor never pings sessions itself. Each WebSocket handler pings its own
//! peer every interval and records liveness on every inbound frame, so a session
//! only stays fresh while its peer is actually answering. A successful server-side
//! send would prove nothing about the peer.
//!
//! ## Failure isolation:
//! Each cycle runs in its own task. If it panics the join error is logged, counted,
//! and the monitor retries after a short back-off instead of dying. The monitor
//! stops only when the shutdown channel carries `true`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::registry::{ConnectionRegistry, SessionId};
use crate::config::WebSocketConfig;

/// Counters updated by the monitor, read by the health endpoints.
#[derive(Debug, Default)]
pub struct MonitorStats {
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    slow_cycles: AtomicU64,
    evicted: AtomicU64,
    last_cycle_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub slow_cycles: u64,
    pub evicted_total: u64,
    pub last_cycle_ms: f64,
}

impl MonitorStats {
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            slow_cycles: self.slow_cycles.load(Ordering::Relaxed),
            evicted_total: self.evicted.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug)]
pub struct CycleReport {
    pub evicted: Vec<SessionId>,
    pub active: usize,
    pub elapsed: Duration,
}

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    backoff: Duration,
    slow_threshold: Duration,
    stats: Arc<MonitorStats>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, config: &WebSocketConfig) -> Self {
        Self {
            registry,
            interval: config.heartbeat_interval(),
            backoff: config.monitor_backoff(),
            slow_threshold: config.slow_cycle_threshold(),
            stats: Arc::new(MonitorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    /// Run the monitor on the tokio runtime until `shutdown` flips to true or its
    /// sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        self.run_with(shutdown, |registry, started| async move {
            run_cycle(&registry, started).await
        })
        .await
    }

    async fn run_with<F, Fut>(self, mut shutdown: watch::Receiver<bool>, cycle: F)
    where
        F: Fn(Arc<ConnectionRegistry>, Instant) -> Fut,
        Fut: Future<Output = CycleReport> + Send + 'static,
    {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.registry.connection_timeout().as_secs(),
            "Heartbeat monitor started"
        );

        let mut watching = true;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let handle = tokio::spawn(cycle(self.registry.clone(), started));

            let next_cycle = match handle.await {
                Ok(report) => {
                    self.record(&report);
                    started + self.interval
                }
                Err(err) => {
                    self.stats.failed_cycles.fetch_add(1, Ordering::Relaxed);
                    error!("Error in heartbeat monitor: {}", err);
                    Instant::now() + self.backoff
                }
            };

            if pause_until(&mut shutdown, &mut watching, next_cycle).await {
                break;
            }
        }

        info!("Heartbeat monitor stopped");
    }

    fn record(&self, report: &CycleReport) {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.stats
            .evicted
            .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);
        self.stats
            .last_cycle_micros
            .store(report.elapsed.as_micros() as u64, Ordering::Relaxed);

        if report.elapsed > self.slow_threshold {
            self.stats.slow_cycles.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Heartbeat monitor exceeded latency threshold: {:.3}s",
                report.elapsed.as_secs_f64()
            );
        }
    }
}

/// Sleep until `deadline`. True if shutdown was requested first.
///
/// Only an explicit `true` stops the monitor. A dropped sender means nobody can
/// ask for shutdown any more, so the monitor keeps sweeping.
async fn pause_until(shutdown: &mut watch::Receiver<bool>, watching: &mut bool, deadline: Instant) -> bool {
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    while *watching {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => {}
                Err(_) => {
                    warn!("Shutdown channel closed, heartbeat monitor keeps running");
                    *watching = false;
                }
            },
        }
    }

    sleep.await;
    false
}

/// One sweep of the registry using `now` as the reference time.
pub async fn run_cycle(registry: &ConnectionRegistry, now: Instant) -> CycleReport {
    let evicted = registry.sweep_stale(now).await;
    if !evicted.is_empty() {
        info!(count = evicted.len(), "Evicted stale connections");
    }

    let active = registry.active_count();
    if active > 0 {
        info!("Monitoring {} active connections", active);
    } else {
        debug!("No active connections");
    }

    CycleReport {
        evicted,
        active,
        elapsed: now.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::registry::RegistryConfig;
    use crate::connection::testing::MockTransport;

    fn setup() -> (Arc<ConnectionRegistry>, HeartbeatMonitor) {
        let config = WebSocketConfig::default();
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::from(&config)));
        let monitor = HeartbeatMonitor::new(registry.clone(), &config);
        (registry, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_evicts_silent_session() {
        let (registry, monitor) = setup();
        let stats = monitor.stats();
        let (_tx, rx) = watch::channel(false);

        registry.connect("x", MockTransport::new()).await.unwrap();
        monitor.spawn(rx);

        // Cycles at t=0, 30, 60 leave it alone (60s is not *more* than the timeout).
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(registry.is_connected("x"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!registry.is_connected("x"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles, 4);
        assert_eq!(snapshot.evicted_total, 1);
        assert_eq!(snapshot.failed_cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_spares_heartbeating_session() {
        let (registry, monitor) = setup();
        let (_tx, rx) = watch::channel(false);

        registry.connect("y", MockTransport::new()).await.unwrap();
        monitor.spawn(rx);

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert!(registry.send_heartbeat("y").await.unwrap());
        }

        assert!(registry.is_connected("y"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_survives_panicking_cycle() {
        use std::sync::atomic::AtomicBool;

        let (registry, monitor) = setup();
        let stats = monitor.stats();
        let (_tx, rx) = watch::channel(false);

        let panicked = Arc::new(AtomicBool::new(false));
        let cycle = move |registry: Arc<ConnectionRegistry>, now: Instant| {
            let first = !panicked.swap(true, Ordering::SeqCst);
            async move {
                if first {
                    panic!("sweep blew up");
                }
                run_cycle(&registry, now).await
            }
        };
        tokio::spawn(monitor.run_with(rx, cycle));

        registry.connect("healthy", MockTransport::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(stats.snapshot().failed_cycles, 1);
        assert_eq!(stats.snapshot().cycles, 1);

        // Cycles resume at 1s, 31s and 61s; at 61s the session is past the 60s timeout.
        tokio::time::sleep(Duration::from_secs(90)).await;

        assert!(!registry.is_connected("healthy"));
        assert_eq!(stats.snapshot().failed_cycles, 1);
        assert_eq!(stats.snapshot().evicted_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_keeps_sweeping_after_sender_dropped() {
        let (registry, monitor) = setup();
        let (tx, rx) = watch::channel(false);

        registry.connect("x", MockTransport::new()).await.unwrap();
        let handle = monitor.spawn(rx);
        drop(tx);

        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(!registry.is_connected("x"));
        assert!(!handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_shutdown() {
        let (_registry, monitor) = setup();
        let (tx, rx) = watch::channel(false);

        let handle = monitor.spawn(rx);
        tokio::time::sleep(Duration::from_secs(45)).await;
        tx.send(true).unwrap();

        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_uses_single_reference_time() {
        let (registry, _monitor) = setup();
        registry.connect("old", MockTransport::new()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let now = Instant::now();
        registry.connect("new", MockTransport::new()).await.unwrap();

        let report = run_cycle(&registry, now).await;
        assert_eq!(report.evicted, vec!["old".to_string()]);
        assert_eq!(report.active, 1);
    }
}
