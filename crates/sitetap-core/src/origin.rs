//! Tab → page-origin tracking for resolving unattributed traffic.

use std::collections::HashMap;

use url::Url;

use crate::types::TabId;

/// Maps each tab to the origin of its current page.
///
/// Updated on navigation and activation events. Used only to resolve
/// traffic whose tab attribution is ambiguous; never authoritative for
/// filter or ledger state.
#[derive(Debug, Default)]
pub struct OriginTracker {
    origins: HashMap<TabId, String>,
}

impl OriginTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&mut self, tab: TabId, origin: impl Into<String>) {
        self.origins.insert(tab, origin.into());
    }

    pub fn origin_of(&self, tab: TabId) -> Option<&str> {
        self.origins.get(&tab).map(String::as_str)
    }

    pub fn forget(&mut self, tab: TabId) {
        self.origins.remove(&tab);
    }

    /// All tabs currently on `origin`, in ascending tab order.
    pub fn tabs_on(&self, origin: &str) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self
            .origins
            .iter()
            .filter(|(_, o)| o.as_str() == origin)
            .map(|(tab, _)| *tab)
            .collect();
        tabs.sort();
        tabs
    }
}

/// The `scheme://host[:port]` origin of a URL. `None` for URLs without a
/// tuple origin (about:, data:, file:, unparsable input).
pub fn origin_of_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    if !origin.is_tuple() {
        return None;
    }
    Some(origin.ascii_serialization())
}
