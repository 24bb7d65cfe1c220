//! Process-wide session state owned by the coordinator.

use std::collections::HashMap;

use sitetap_core::{OriginTracker, RequestLedger, TabId};

/// Single-owner container for per-tab session state.
///
/// Constructed once at process start; the coordinator is the only writer,
/// so no locking is needed. A tab's entries are torn down explicitly when
/// the tab closes.
#[derive(Debug)]
pub struct SessionRegistry {
    pub ledger: RequestLedger,
    pub origins: OriginTracker,
    /// Last known page URL per tab, fed by navigation and activation events.
    pub tab_urls: HashMap<TabId, String>,
    /// Most recently activated tab.
    pub active_tab: Option<TabId>,
}

impl SessionRegistry {
    pub fn new(ledger: RequestLedger) -> Self {
        Self {
            ledger,
            origins: OriginTracker::new(),
            tab_urls: HashMap::new(),
            active_tab: None,
        }
    }

    /// Tear down all state for a closed tab.
    pub fn drop_tab(&mut self, tab: TabId) {
        self.ledger.clear(tab);
        self.origins.forget(tab);
        self.tab_urls.remove(&tab);
        if self.active_tab == Some(tab) {
            self.active_tab = None;
        }
    }
}
