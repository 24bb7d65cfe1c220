//! Wire protocol for subscriber connections.
//!
//! JSON over WebSocket text frames, tagged by `type`. Client messages bind
//! a connection to a tab and drive the session; server messages carry the
//! snapshot and live ledger mutations.

use serde::{Deserialize, Serialize};

use sitetap_core::{RequestId, RequestRecord, TabId};

/// Messages a subscriber sends over its connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind to a tab and request the current snapshot.
    Initialize { tab_id: TabId },
    /// Bind to the caller-supplied tab, falling back to the most recently
    /// active http(s) tab.
    InitializeActive {
        #[serde(default)]
        tab_id: Option<TabId>,
    },
    /// Wipe the bound tab's ledger.
    Clear,
}

/// Messages pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot of the bound tab's ledger, newest first.
    Init { records: Vec<RequestRecord> },
    RequestAdded { record: RequestRecord },
    RequestUpdated { record: RequestRecord },
    RequestRemoved { request_id: RequestId },
    Cleared,
    /// Active-tab resolution result for `initialize_active`.
    TabSelected { url: String },
    /// No target tab could be resolved; the session was not bound.
    InitError { message: String },
    /// The deep-inspection session attached.
    ResourceReady,
    /// The deep-inspection session could not attach. Non-fatal; a later
    /// initialize may retry.
    ResourceError { message: String },
}
