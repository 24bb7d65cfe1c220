use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::broadcaster::SubscriberId;
use crate::coordinator::Event;
use crate::protocol::{ClientMessage, ServerMessage};

// ---------------------------------------------------------------------------
// Origin validation
// ---------------------------------------------------------------------------

/// Validate the `Origin` header on an incoming WebSocket upgrade request.
///
/// Allowed origins:
/// - `chrome-extension://` / `moz-extension://` (the observer UI)
/// - `http://localhost:*` or `http://127.0.0.1:*` (local dev)
/// - `null` (file:// contexts)
/// - Absent origin header (non-browser clients)
///
/// All other origins are rejected with HTTP 403.
fn validate_origin(
    req: &tokio_tungstenite::tungstenite::handshake::server::Request,
    resp: tokio_tungstenite::tungstenite::handshake::server::Response,
) -> Result<
    tokio_tungstenite::tungstenite::handshake::server::Response,
    tokio_tungstenite::tungstenite::handshake::server::ErrorResponse,
> {
    if let Some(origin) = req.headers().get("origin") {
        let origin_str = origin.to_str().unwrap_or("");
        if origin_str == "null"
            || origin_str.starts_with("chrome-extension://")
            || origin_str.starts_with("moz-extension://")
            || origin_str.starts_with("http://localhost")
            || origin_str.starts_with("http://127.0.0.1")
        {
            return Ok(resp);
        }
        tracing::warn!(origin = %origin_str, "ws: rejected connection from disallowed origin");
        let err_resp = http::Response::builder()
            .status(http::StatusCode::FORBIDDEN)
            .body(Some("Origin not allowed".into()))
            .expect("building error response");
        return Err(err_resp);
    }
    // No origin header = non-browser client, allow.
    Ok(resp)
}

// ---------------------------------------------------------------------------
// WsServer
// ---------------------------------------------------------------------------

/// Default maximum number of concurrent subscriber connections.
const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// WebSocket endpoint for subscriber connections.
///
/// Each accepted connection becomes one subscriber: inbound text frames are
/// parsed as [`ClientMessage`]s and forwarded to the coordinator; the
/// coordinator pushes [`ServerMessage`]s back through a per-subscriber
/// queue that this server drains onto the wire.
pub struct WsServer {
    addr: SocketAddr,
    events_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    max_connections: usize,
    next_subscriber: Arc<AtomicU64>,
}

impl WsServer {
    pub fn new(addr: SocketAddr, events_tx: mpsc::Sender<Event>, cancel: CancellationToken) -> Self {
        Self {
            addr,
            events_tx,
            cancel,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            next_subscriber: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Set the maximum number of concurrent subscriber connections.
    #[allow(dead_code)]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Run the server: bind TCP, accept connections, and spawn per-client
    /// handlers until the cancellation token fires.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, max_connections = self.max_connections, "ws server listening");
        self.serve(listener).await
    }

    /// Bind to the configured address and return the actual local address.
    /// Useful when binding to port 0 to get an OS-assigned ephemeral port.
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, max_connections = self.max_connections, "ws server bound");
        Ok((listener, local_addr))
    }

    /// Run the accept loop on a pre-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let permit = match semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    tracing::warn!(
                                        peer = %peer,
                                        max = self.max_connections,
                                        "ws: connection limit reached, rejecting"
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };
                            let subscriber = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(peer = %peer, subscriber, "ws: TCP connection accepted");
                            let events_tx = self.events_tx.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                match tokio_tungstenite::accept_hdr_async(stream, validate_origin).await {
                                    Ok(ws_stream) => {
                                        if let Err(e) = handle_ws_client(ws_stream, subscriber, events_tx.clone(), cancel).await {
                                            tracing::debug!(peer = %peer, subscriber, error = %e, "ws client handler finished with error");
                                        }
                                        // Unbind and release regardless of how the handler exited.
                                        let _ = events_tx.send(Event::Disconnected { subscriber }).await;
                                    }
                                    Err(e) => {
                                        tracing::debug!(peer = %peer, error = %e, "ws handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "ws: TCP accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("ws server: cancellation requested, shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-client handler
// ---------------------------------------------------------------------------

async fn handle_ws_client(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    subscriber: SubscriberId,
    events_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();

    tracing::debug!(subscriber, "ws client connected");

    loop {
        tokio::select! {
            // --- incoming WebSocket message ---
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(subscriber, error = %e, "ws read error, dropping client");
                        return Err(e.into());
                    }
                    None => {
                        tracing::debug!(subscriber, "ws client disconnected (stream ended)");
                        return Ok(());
                    }
                };

                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => {
                        tracing::debug!(subscriber, "ws client sent close frame");
                        return Ok(());
                    }
                    Message::Ping(data) => {
                        ws_tx.send(Message::Pong(data)).await?;
                        continue;
                    }
                    _ => continue,
                };

                let message: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        // Malformed subscriber input is dropped, never fatal.
                        tracing::debug!(subscriber, error = %e, "malformed subscriber message, ignoring");
                        continue;
                    }
                };

                if events_tx
                    .send(Event::Command {
                        subscriber,
                        sender: out_tx.clone(),
                        message,
                    })
                    .await
                    .is_err()
                {
                    tracing::debug!(subscriber, "coordinator gone, dropping client");
                    return Ok(());
                }
            }

            // --- outbound push from the coordinator ---
            out = out_rx.recv() => {
                // This handler holds a sender clone, so the channel never
                // yields None while the loop runs.
                if let Some(message) = out {
                    let text = serde_json::to_string(&message)?;
                    ws_tx.send(Message::Text(text)).await?;
                }
            }

            // --- cancellation ---
            _ = cancel.cancelled() => {
                tracing::debug!(subscriber, "ws client handler: cancellation requested");
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
