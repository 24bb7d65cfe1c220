//! Exclusive deep-inspection session management.
//!
//! The inspection bridge allows at most one debugger attachment per tab,
//! and several subscribers routinely initialize against the same tab at
//! once. Concurrent acquires must therefore collapse into a single
//! underlying attach whose outcome every caller observes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};

use sitetap_core::{RequestId, TabId};

/// Error from the inspection bridge. Cloneable so one underlying failure
/// can fan out to every waiter on the same attach.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InspectError {
    #[error("inspection bridge: {0}")]
    Bridge(String),
    #[error("no inspection session attached")]
    NotAttached,
    #[error("attach abandoned before settling")]
    Abandoned,
}

/// Response payload fetched through an attached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPayload {
    pub body: String,
    pub base64: bool,
}

/// Low-level network-debugging bridge for one browser.
#[async_trait]
pub trait InspectorBackend: Send + Sync + 'static {
    async fn attach(&self, tab: TabId) -> Result<(), InspectError>;
    async fn detach(&self, tab: TabId) -> Result<(), InspectError>;
    /// Fetch the response payload for a completed request on an attached tab.
    async fn fetch_body(
        &self,
        tab: TabId,
        request_id: &RequestId,
    ) -> Result<BodyPayload, InspectError>;
}

/// Per-tab attachment state. Absence from the table means detached.
enum TapState {
    /// An attach is in flight. Later acquires park here; a release arriving
    /// now is deferred until the attach settles.
    Acquiring {
        waiters: Vec<oneshot::Sender<Result<(), InspectError>>>,
        release_requested: bool,
    },
    Attached,
}

/// Acquires and releases the exclusive deep-inspection session per tab,
/// deduplicating concurrent acquisition attempts.
#[derive(Clone)]
pub struct InspectionSessionManager {
    backend: Arc<dyn InspectorBackend>,
    tabs: Arc<Mutex<HashMap<TabId, TapState>>>,
}

impl InspectionSessionManager {
    pub fn new(backend: Arc<dyn InspectorBackend>) -> Self {
        Self {
            backend,
            tabs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the inspection session for `tab`.
    ///
    /// Resolves immediately when already attached. When an attach is already
    /// in flight, awaits that same attempt: at most one underlying attach is
    /// ever issued per tab regardless of caller concurrency. On failure the
    /// in-flight entry is cleared, so a later acquire retries fresh.
    pub async fn acquire(&self, tab: TabId) -> Result<(), InspectError> {
        let rx = {
            let mut tabs = self.tabs.lock().await;
            match tabs.get_mut(&tab) {
                Some(TapState::Attached) => return Ok(()),
                Some(TapState::Acquiring { waiters, .. }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    tabs.insert(
                        tab,
                        TapState::Acquiring {
                            waiters: vec![tx],
                            release_requested: false,
                        },
                    );
                    let manager = self.clone();
                    tokio::spawn(async move {
                        let result = manager.backend.attach(tab).await;
                        manager.settle_attach(tab, result).await;
                    });
                    rx
                }
            }
        };
        rx.await.unwrap_or(Err(InspectError::Abandoned))
    }

    /// Release the inspection session for `tab`.
    ///
    /// No-op unless attached or acquiring. While an attach is in flight the
    /// detach is deferred until it settles rather than racing the bridge.
    /// Teardown is best-effort: the state returns to detached regardless of
    /// the bridge call's own outcome.
    pub async fn release(&self, tab: TabId) {
        let detach_now = {
            let mut tabs = self.tabs.lock().await;
            match tabs.get_mut(&tab) {
                Some(TapState::Attached) => {
                    tabs.remove(&tab);
                    true
                }
                Some(TapState::Acquiring {
                    release_requested, ..
                }) => {
                    *release_requested = true;
                    false
                }
                None => false,
            }
        };
        if detach_now {
            if let Err(e) = self.backend.detach(tab).await {
                tracing::debug!(%tab, error = %e, "detach failed");
            }
        }
    }

    pub async fn is_attached(&self, tab: TabId) -> bool {
        matches!(self.tabs.lock().await.get(&tab), Some(TapState::Attached))
    }

    /// Fetch supplementary response data through the attached session.
    pub async fn fetch_body(
        &self,
        tab: TabId,
        request_id: &RequestId,
    ) -> Result<BodyPayload, InspectError> {
        if !self.is_attached(tab).await {
            return Err(InspectError::NotAttached);
        }
        self.backend.fetch_body(tab, request_id).await
    }

    /// Completion path for an attach attempt: advance the state machine and
    /// fan the outcome out to every waiter.
    async fn settle_attach(&self, tab: TabId, result: Result<(), InspectError>) {
        let (waiters, release_requested) = {
            let mut tabs = self.tabs.lock().await;
            let (waiters, release_requested) = match tabs.remove(&tab) {
                Some(TapState::Acquiring {
                    waiters,
                    release_requested,
                }) => (waiters, release_requested),
                Some(other) => {
                    // A teardown raced the settle; restore and bail.
                    tabs.insert(tab, other);
                    return;
                }
                None => return,
            };
            if result.is_ok() && !release_requested {
                tabs.insert(tab, TapState::Attached);
            }
            (waiters, release_requested)
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        // A release that arrived mid-attach detaches now that the bridge
        // has actually attached.
        if result.is_ok() && release_requested {
            if let Err(e) = self.backend.detach(tab).await {
                tracing::debug!(%tab, error = %e, "deferred detach failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeBackend
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct BridgeCommand<'a> {
    op: &'a str,
    tab: TabId,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    base64: bool,
}

/// Production backend talking to the browser-side instrumentation bridge.
///
/// Each operation opens a connection to the bridge socket, writes one JSON
/// command line, and reads one JSON reply line.
pub struct BridgeBackend {
    socket_path: PathBuf,
}

impl BridgeBackend {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn call(&self, command: BridgeCommand<'_>) -> Result<BridgeReply, InspectError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            InspectError::Bridge(format!("connect {}: {e}", self.socket_path.display()))
        })?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_vec(&command)
            .map_err(|e| InspectError::Bridge(e.to_string()))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| InspectError::Bridge(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| InspectError::Bridge(e.to_string()))?;

        let mut lines = BufReader::new(reader).lines();
        let reply = lines
            .next_line()
            .await
            .map_err(|e| InspectError::Bridge(e.to_string()))?
            .ok_or_else(|| InspectError::Bridge("bridge closed without replying".into()))?;
        let reply: BridgeReply = serde_json::from_str(&reply)
            .map_err(|e| InspectError::Bridge(format!("bad bridge reply: {e}")))?;

        if reply.ok {
            Ok(reply)
        } else {
            Err(InspectError::Bridge(
                reply.error.unwrap_or_else(|| "unspecified bridge error".into()),
            ))
        }
    }
}

#[async_trait]
impl InspectorBackend for BridgeBackend {
    async fn attach(&self, tab: TabId) -> Result<(), InspectError> {
        self.call(BridgeCommand {
            op: "attach",
            tab,
            request_id: None,
        })
        .await
        .map(|_| ())
    }

    async fn detach(&self, tab: TabId) -> Result<(), InspectError> {
        self.call(BridgeCommand {
            op: "detach",
            tab,
            request_id: None,
        })
        .await
        .map(|_| ())
    }

    async fn fetch_body(
        &self,
        tab: TabId,
        request_id: &RequestId,
    ) -> Result<BodyPayload, InspectError> {
        let reply = self
            .call(BridgeCommand {
                op: "fetch_body",
                tab,
                request_id: Some(request_id),
            })
            .await?;
        Ok(BodyPayload {
            body: reply.body.unwrap_or_default(),
            base64: reply.base64,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
