//! Ingest of raw traffic and tab events from the browser-side
//! instrumentation.
//!
//! The instrumentation connects to a Unix stream socket and writes one JSON
//! event per line. Events are translated into coordinator events here; the
//! coordinator applies filtering, attribution, and fan-out.

use std::path::PathBuf;

use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use sitetap_core::{CaptureOrigin, Header, NetworkEvent, RecordPatch, TabEvent, TabId};

use crate::coordinator::Event;

/// JSON payload sent by the instrumentation, tagged by `event`.
///
/// Examples:
/// ```json
/// {"event":"request","tab":12,"request_id":"r-1","url":"https://chatgpt.com/backend-api/conversation/x","method":"GET","resource_type":"xhr"}
/// {"event":"response","tab":12,"request_id":"r-1","status":200,"status_line":"HTTP/1.1 200 OK","remote_ip":"104.18.0.1"}
/// {"event":"completed","tab":12,"request_id":"r-1"}
/// {"event":"tab_navigated","tab":12,"url":"https://chatgpt.com/c/x"}
/// ```
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WireEvent {
    /// A request is leaving the browser.
    Request {
        tab: TabId,
        request_id: String,
        url: String,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        resource_type: Option<String>,
        #[serde(default)]
        initiator: Option<String>,
        #[serde(default)]
        body: Option<String>,
    },
    /// Request headers became known (sent separately by some interception
    /// layers).
    RequestHeaders {
        tab: TabId,
        request_id: String,
        headers: Vec<Header>,
    },
    /// Response headers arrived.
    Response {
        tab: TabId,
        request_id: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        status_line: Option<String>,
        #[serde(default)]
        headers: Option<Vec<Header>>,
        #[serde(default)]
        from_cache: Option<bool>,
        #[serde(default)]
        remote_ip: Option<String>,
    },
    /// The request finished.
    Completed {
        tab: TabId,
        request_id: String,
        #[serde(default)]
        from_cache: Option<bool>,
    },
    /// Response payload pushed by the deep-inspection session.
    InspectorBody {
        tab: TabId,
        request_id: String,
        body: String,
        #[serde(default)]
        base64: bool,
    },
    TabNavigated { tab: TabId, url: String },
    TabActivated { tab: TabId, url: String },
    TabClosed { tab: TabId },
}

/// Map a wire event to a coordinator event.
pub fn wire_to_event(wire: WireEvent) -> Event {
    match wire {
        WireEvent::Request {
            tab,
            request_id,
            url,
            method,
            resource_type,
            initiator,
            body,
        } => Event::Network(NetworkEvent {
            tab,
            request_id,
            patch: RecordPatch {
                url: Some(url),
                method,
                resource_type,
                initiator,
                request_body: body,
                capture: Some(CaptureOrigin::Interception),
                ..Default::default()
            },
        }),
        WireEvent::RequestHeaders {
            tab,
            request_id,
            headers,
        } => Event::Network(NetworkEvent {
            tab,
            request_id,
            patch: RecordPatch {
                request_headers: Some(headers),
                ..Default::default()
            },
        }),
        WireEvent::Response {
            tab,
            request_id,
            status,
            status_line,
            headers,
            from_cache,
            remote_ip,
        } => Event::Network(NetworkEvent {
            tab,
            request_id,
            patch: RecordPatch {
                status_code: status,
                status_line,
                response_headers: headers,
                from_cache,
                remote_ip,
                ..Default::default()
            },
        }),
        WireEvent::Completed {
            tab,
            request_id,
            from_cache,
        } => Event::Network(NetworkEvent {
            tab,
            request_id,
            patch: RecordPatch {
                completed: Some(true),
                from_cache,
                ..Default::default()
            },
        }),
        WireEvent::InspectorBody {
            tab,
            request_id,
            body,
            base64,
        } => Event::Network(NetworkEvent {
            tab,
            request_id,
            patch: RecordPatch {
                response_body: Some(body),
                body_base64: Some(base64),
                capture: Some(CaptureOrigin::Inspector),
                ..Default::default()
            },
        }),
        WireEvent::TabNavigated { tab, url } => Event::Tab(TabEvent::Navigated { tab, url }),
        WireEvent::TabActivated { tab, url } => Event::Tab(TabEvent::Activated { tab, url }),
        WireEvent::TabClosed { tab } => Event::Tab(TabEvent::Closed { tab }),
    }
}

/// Receives JSON capture events on a Unix stream socket and forwards them
/// to the coordinator.
pub struct CaptureSource {
    tx: mpsc::Sender<Event>,
    socket_path: PathBuf,
}

impl CaptureSource {
    pub fn new(tx: mpsc::Sender<Event>, socket_path: PathBuf) -> Self {
        Self { tx, socket_path }
    }

    /// Listen for capture events. Each connection sends newline-delimited
    /// JSON. Blocks until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Remove stale socket file if it exists.
        if self.socket_path.exists() {
            tokio::fs::remove_file(&self.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(path = %self.socket_path.display(), "capture source listening");

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let tx = self.tx.clone();

                    tokio::spawn(async move {
                        let reader = tokio::io::BufReader::new(stream);
                        let mut lines = reader.lines();

                        while let Ok(Some(line)) = lines.next_line().await {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }

                            match serde_json::from_str::<WireEvent>(line) {
                                Ok(wire) => {
                                    if let Err(e) = tx.send(wire_to_event(wire)).await {
                                        tracing::warn!("failed to forward capture event: {e}");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("failed to parse capture JSON: {e}, line: {line}");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("capture accept error: {e}");
                    continue;
                }
            }
        }
    }
}
