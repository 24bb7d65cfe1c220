use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sitetap_core::{RequestFilter, RequestLedger, DEFAULT_CAPACITY};
use sitetap_daemon::coordinator::SessionCoordinator;
use sitetap_daemon::inspector::{BridgeBackend, InspectionSessionManager};
use sitetap_daemon::registry::SessionRegistry;
use sitetap_daemon::sources::capture::CaptureSource;
use sitetap_daemon::ws_server::WsServer;

/// Default directory for runtime sockets.
const DEFAULT_SOCKET_DIR: &str = "/tmp/sitetap";
const DEFAULT_CAPTURE_SOCKET: &str = "/tmp/sitetap/capture.sock";
const DEFAULT_BRIDGE_SOCKET: &str = "/tmp/sitetap/bridge.sock";
const DEFAULT_WS_ADDR: &str = "127.0.0.1:9823";

#[derive(Parser)]
#[command(name = "sitetap", about = "Per-tab HTTP traffic capture and fan-out daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default when no subcommand given)
    Daemon {
        /// Address for subscriber WebSocket connections
        #[arg(long, default_value = DEFAULT_WS_ADDR)]
        ws_addr: String,

        /// Socket path for capture events from the instrumentation
        #[arg(long, default_value = DEFAULT_CAPTURE_SOCKET)]
        capture_socket: String,

        /// Socket path for deep-inspection bridge commands
        #[arg(long, default_value = DEFAULT_BRIDGE_SOCKET)]
        bridge_socket: String,

        /// Records retained per tab before the oldest are evicted
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        capacity: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing. Respects RUST_LOG env var, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let (ws_addr, capture_socket, bridge_socket, capacity) = match cli.command {
        Some(Commands::Daemon {
            ws_addr,
            capture_socket,
            bridge_socket,
            capacity,
        }) => (ws_addr, capture_socket, bridge_socket, capacity),
        // Default to daemon when no subcommand is given.
        None => (
            DEFAULT_WS_ADDR.to_string(),
            DEFAULT_CAPTURE_SOCKET.to_string(),
            DEFAULT_BRIDGE_SOCKET.to_string(),
            DEFAULT_CAPACITY,
        ),
    };

    run_daemon(ws_addr, capture_socket, bridge_socket, capacity).await
}

async fn run_daemon(
    ws_addr: String,
    capture_socket: String,
    bridge_socket: String,
    capacity: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        ws_addr = %ws_addr,
        capture_socket = %capture_socket,
        bridge_socket = %bridge_socket,
        capacity,
        "starting sitetap daemon"
    );

    // Ensure the socket directory exists.
    std::fs::create_dir_all(PathBuf::from(DEFAULT_SOCKET_DIR))?;

    // Event channel: sources and subscriber handlers -> coordinator.
    let (events_tx, events_rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();

    let backend = Arc::new(BridgeBackend::new(PathBuf::from(&bridge_socket)));
    let inspector = InspectionSessionManager::new(backend);

    let registry = SessionRegistry::new(RequestLedger::with_capacity(
        RequestFilter::new(),
        capacity,
    ));
    let mut coordinator = SessionCoordinator::new(
        registry,
        inspector,
        events_rx,
        events_tx.clone(),
        cancel.clone(),
    );

    let capture = CaptureSource::new(events_tx.clone(), PathBuf::from(&capture_socket));
    let ws_server = WsServer::new(ws_addr.parse()?, events_tx, cancel.clone());

    tracing::info!("all components created, starting event loops");

    tokio::select! {
        _ = coordinator.run() => {
            tracing::warn!("session coordinator exited unexpectedly");
        }
        result = capture.run() => {
            match result {
                Ok(()) => tracing::warn!("capture source exited unexpectedly"),
                Err(e) => tracing::warn!("capture source error: {e}"),
            }
        }
        result = ws_server.run() => {
            match result {
                Ok(()) => tracing::warn!("ws server exited unexpectedly"),
                Err(e) => tracing::warn!("ws server error: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            cancel.cancel();
        }
    }

    Ok(())
}
