//! Bounded, indexed, per-tab collection of captured requests.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::filter::RequestFilter;
use crate::record::{RecordPatch, RequestRecord};
use crate::types::{RequestId, TabId};

/// Maximum records retained per tab before the oldest are evicted.
pub const DEFAULT_CAPACITY: usize = 500;

/// Subscriber-visible effect of one [`RequestLedger::upsert`].
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// A fresh record was created. `evicted` lists the ids dropped to stay
    /// within capacity, oldest first.
    Inserted {
        record: RequestRecord,
        evicted: Vec<RequestId>,
    },
    /// An existing record was merge-updated.
    Updated { record: RequestRecord },
    /// The update made the record fall out of filter scope; it was removed
    /// rather than retained stale.
    Removed { request_id: RequestId },
    /// Creation was gated off by the filter; nothing was stored.
    Dropped,
}

/// One tab's slice of the ledger.
#[derive(Debug, Default)]
struct TabLedger {
    /// Insertion order, newest first. Eviction pops the back.
    order: VecDeque<RequestId>,
    records: HashMap<RequestId, RequestRecord>,
}

/// Per-tab bounded, indexed collection of request records with merge-update
/// and FIFO eviction.
///
/// The composite key `(tab, request_id)` is unique within a tab; `upsert`
/// never creates a duplicate. Ordering is insertion-recency (newest first);
/// merge updates do not reorder.
#[derive(Debug)]
pub struct RequestLedger {
    capacity: usize,
    filter: RequestFilter,
    tabs: HashMap<TabId, TabLedger>,
}

impl RequestLedger {
    pub fn new(filter: RequestFilter) -> Self {
        Self::with_capacity(filter, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(filter: RequestFilter, capacity: usize) -> Self {
        Self {
            capacity,
            filter,
            tabs: HashMap::new(),
        }
    }

    /// Merge `patch` into the record for `(tab, request_id)`, creating it if
    /// absent.
    ///
    /// Creation is gated by the filter on the candidate URL: a miss is a
    /// silent drop. For an existing record the filter is re-checked against
    /// the best-known URL (the patched one, or the prior one when the patch
    /// carries none); a miss removes the record and reports it.
    pub fn upsert(
        &mut self,
        tab: TabId,
        request_id: &str,
        patch: RecordPatch,
        now: DateTime<Utc>,
    ) -> UpsertOutcome {
        if let Some(tab_ledger) = self.tabs.get_mut(&tab) {
            if let Some(record) = tab_ledger.records.get_mut(request_id) {
                let url = patch.url.as_deref().unwrap_or(&record.url);
                if !self.filter.matches(url) {
                    tab_ledger.records.remove(request_id);
                    tab_ledger.order.retain(|id| id != request_id);
                    return UpsertOutcome::Removed {
                        request_id: request_id.to_string(),
                    };
                }
                record.apply(patch);
                return UpsertOutcome::Updated {
                    record: record.clone(),
                };
            }
        }

        let url = patch.url.as_deref().unwrap_or("");
        if !self.filter.matches(url) {
            return UpsertOutcome::Dropped;
        }

        let mut record = RequestRecord::new(tab, request_id.to_string(), now);
        record.apply(patch);

        let tab_ledger = self.tabs.entry(tab).or_default();
        tab_ledger.order.push_front(record.request_id.clone());
        tab_ledger
            .records
            .insert(record.request_id.clone(), record.clone());

        let mut evicted = Vec::new();
        while tab_ledger.order.len() > self.capacity {
            if let Some(oldest) = tab_ledger.order.pop_back() {
                tab_ledger.records.remove(&oldest);
                evicted.push(oldest);
            }
        }

        UpsertOutcome::Inserted { record, evicted }
    }

    /// Explicit removal by composite key.
    pub fn remove(&mut self, tab: TabId, request_id: &str) -> Option<RequestRecord> {
        let tab_ledger = self.tabs.get_mut(&tab)?;
        let record = tab_ledger.records.remove(request_id)?;
        tab_ledger.order.retain(|id| id != request_id);
        Some(record)
    }

    /// Snapshot of a tab's records, newest first.
    pub fn list(&self, tab: TabId) -> Vec<RequestRecord> {
        match self.tabs.get(&tab) {
            Some(tab_ledger) => tab_ledger
                .order
                .iter()
                .filter_map(|id| tab_ledger.records.get(id))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Wipe a tab's records and index entries together. Returns how many
    /// records were dropped.
    pub fn clear(&mut self, tab: TabId) -> usize {
        self.tabs
            .remove(&tab)
            .map(|tab_ledger| tab_ledger.records.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, tab: TabId, request_id: &str) -> bool {
        self.tabs
            .get(&tab)
            .is_some_and(|t| t.records.contains_key(request_id))
    }

    pub fn len(&self, tab: TabId) -> usize {
        self.tabs.get(&tab).map_or(0, |t| t.records.len())
    }

    pub fn is_empty(&self, tab: TabId) -> bool {
        self.len(tab) == 0
    }
}
