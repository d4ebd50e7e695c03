//! # Voice Companion Backend - Main Application Entry Point
//!
//! Actix-web server that holds the long-lived WebSocket sessions of the voice
//! companion clients.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **connection**: WebSocket session registry and heartbeat monitor
//! - **websocket**: The `/ws` endpoint and its per-connection actor
//! - **protocol**: JSON messages exchanged over the WebSocket
//! - **state**: Shared application state and request metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request metrics collection
//! - **handlers**: Remaining HTTP handlers
//! - **error**: HTTP error responses
//!
//! ## Composition:
//! `main` builds the one `ConnectionRegistry`, starts the `HeartbeatMonitor` on it,
//! and passes the same `Arc` to every request through `AppState`. Shutdown is
//! signalled through a `watch` channel rather than a global flag.

mod config;
mod connection;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use connection::{CloseReason, ConnectionRegistry, HeartbeatMonitor, RegistryConfig};
use state::AppState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        max_connections = config.websocket.max_connections,
        heartbeat_interval_secs = config.websocket.heartbeat_interval_secs,
        connection_timeout_secs = config.websocket.connection_timeout_secs,
        "Configuration loaded"
    );

    let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::from(&config.websocket)));
    let monitor = HeartbeatMonitor::new(registry.clone(), &config.websocket);
    let app_state = AppState::new(config.clone(), registry.clone(), monitor.stats());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = monitor.spawn(shutdown_rx.clone());

    setup_signal_handlers(shutdown_tx);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::voice_websocket))
            .default_service(web::to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown(shutdown_rx) => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let closed = registry.close_all(CloseReason::Shutdown).await;
    info!(closed, "Closed remaining WebSocket sessions");

    if let Err(e) = monitor_task.await {
        error!("Heartbeat monitor task error: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_companion_backend=trace")
/// - If not set, defaults to "voice_companion_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_companion_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Flip the shutdown channel on SIGTERM or SIGINT.
///
/// The monitor and the server both watch the same channel. If a handler cannot be
/// installed the error is logged and the server keeps running without it.
fn setup_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        // Receivers may already be gone if the server stopped on its own.
        let _ = shutdown.send(true);
    });
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            // Sender dropped without a signal: no handler installed, wait forever.
            std::future::pending::<()>().await;
        }
    }
}
