//! # Workty Supervisor
//!
//! The supervisor is a multi-tenant orchestration service that runs workty
//! workflows on a pool of remote worker devices. Clients connect over
//! websocket channels scoped to a tenant and a context, send commands, and
//! receive live change broadcasts; the supervisor borrows a device per
//! running workflow, dispatches each instance's code to it, and returns the
//! device when the workflow pauses, stops, or completes.
//!
//! ## Crate Organization
//!
//! - **api/**: HTTP and websocket API for client communication
//!   - **auth.rs**: API key authentication middleware
//!   - **channels.rs**: per tenant+context websocket channels
//! - **device_ws.rs**: websocket transport to worker devices
//! - **supervisor.rs**: bootstrap and periodic loops
//! - **config.rs**: Configuration management
//! - **error.rs**: HTTP error rendering
//! - **main.rs**: Application entry point and server setup
//!
//! The domain engine (contexts, workflow state machines, store boundary)
//! lives in the `workty-core` crate; message types in `workty-protocol`.

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use axum::Router;
use clap::Parser;
use config::Config;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use workty_core::contexts::ContextLocator;
use workty_core::store::MemoryStore;

mod api;
mod config;
mod device_ws;
mod error;
mod supervisor;

/// Multi-tenant orchestration supervisor for workty workflows
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// API key for authentication
    #[arg(long, env = "WORKTY_API_KEY")]
    api_key: String,

    /// Host address to bind to
    #[arg(long, env = "WORKTY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "WORKTY_PORT", default_value = "3131")]
    port: u16,

    /// Per-execution timeout in seconds
    #[arg(long, env = "WORKTY_EXECUTE_TIMEOUT", default_value = "300")]
    execute_timeout: u64,

    /// Device reconnect / workflow resumption sweep interval in seconds
    #[arg(long, env = "WORKTY_SWEEP_INTERVAL", default_value = "30")]
    sweep_interval: u64,

    /// Device heartbeat interval in seconds
    #[arg(long, env = "WORKTY_HEARTBEAT_INTERVAL", default_value = "10")]
    heartbeat_interval: u64,

    /// Logging level (info, debug, trace)
    #[arg(long, env = "WORKTY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

type ApiContextRef = Arc<ApiContext>;

pub struct ApiContext {
    pub config: Config,
    pub locator: Arc<ContextLocator>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = Level::from_str(cli.log_level.to_lowercase().as_str()).unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true),
        )
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        "Starting Workty Supervisor"
    );

    let config = match Config::try_new(
        cli.api_key,
        cli.execute_timeout,
        cli.sweep_interval,
        cli.heartbeat_interval,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        execute_timeout = ?config.execute_timeout,
        sweep_interval = ?config.sweep_interval,
        heartbeat_interval = ?config.heartbeat_interval,
        "Configuration validated successfully"
    );

    let store = Arc::new(MemoryStore::new());
    let connector = Arc::new(device_ws::WsConnector);
    let locator = match supervisor::bootstrap(store, connector, &config).await {
        Ok(locator) => locator,
        Err(e) => {
            error!("Bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    let context = Arc::new(ApiContext {
        config: config.clone(),
        locator: Arc::clone(&locator),
    });

    // Create shutdown signal handler
    let shutdown_token = CancellationToken::new();
    let shutdown_token_ = shutdown_token.clone();

    // Spawn a task to handle shutdown signals
    tokio::spawn(async move {
        handle_shutdown_signals(shutdown_token_).await;
    });

    let loop_handles = supervisor::spawn_loops(locator, &config, shutdown_token.clone());

    let app = Router::new()
        .merge(api::router(Arc::clone(&context)))
        .with_state(context);

    let addr: SocketAddr = match format!("{}:{}", cli.host, cli.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse socket address: {}", e);
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "Listening for connections");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server started, press Ctrl+C to stop");
    let server_handle = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_token))
        .await;

    match server_handle {
        Ok(_) => info!("Server shut down gracefully"),
        Err(e) => error!(error = %e, "Server error during shutdown"),
    }

    for handle in loop_handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background loop ended abnormally");
        }
    }

    info!("Workty supervisor shutdown complete");
}

/// Handler function for shutdown signals
async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    // Signal the server to shut down
    shutdown_token.cancel();
}

/// Returns a future that resolves when the shutdown signal is received
async fn shutdown_signal_handler(token: CancellationToken) {
    token.cancelled().await;
    info!("Shutdown signal received, starting graceful shutdown");

    // Give in-flight requests some time to complete
    tokio::time::sleep(Duration::from_secs(1)).await;
}
