//! Events flowing from capture sources into the session coordinator.

use crate::record::RecordPatch;
use crate::types::{RequestId, TabId};

/// A traffic observation for one composite key: the delta to merge into
/// that key's record.
#[derive(Debug, Clone)]
pub struct NetworkEvent {
    pub tab: TabId,
    pub request_id: RequestId,
    pub patch: RecordPatch,
}

/// Browser tab lifecycle changes.
#[derive(Debug, Clone)]
pub enum TabEvent {
    Navigated { tab: TabId, url: String },
    Activated { tab: TabId, url: String },
    Closed { tab: TabId },
}
