//! Fan-out of ledger mutation events to the subscribers bound to a tab.

use std::collections::HashMap;

use tokio::sync::mpsc;

use sitetap_core::TabId;

use crate::protocol::ServerMessage;

/// Identifier for one subscriber connection.
pub type SubscriberId = u64;

/// Outbound handle for one subscriber connection. The connection handler
/// drains the receiving end onto the wire.
pub type SubscriberSender = mpsc::UnboundedSender<ServerMessage>;

/// Tab-scoped subscriber registry.
///
/// A subscriber is bound to at most one tab. Delivery to a subscriber whose
/// connection is gone fails on the channel send and is ignored; the
/// remaining subscribers still receive the message.
#[derive(Debug, Default)]
pub struct Broadcaster {
    by_tab: HashMap<TabId, HashMap<SubscriberId, SubscriberSender>>,
    bindings: HashMap<SubscriberId, TabId>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `subscriber` to `tab`, replacing any previous binding. Returns
    /// the tab it was bound to before, if any.
    pub fn bind(
        &mut self,
        subscriber: SubscriberId,
        tab: TabId,
        sender: SubscriberSender,
    ) -> Option<TabId> {
        let previous = self.unbind(subscriber);
        self.bindings.insert(subscriber, tab);
        self.by_tab.entry(tab).or_default().insert(subscriber, sender);
        previous
    }

    /// Remove a subscriber's binding. Returns the tab it was bound to.
    pub fn unbind(&mut self, subscriber: SubscriberId) -> Option<TabId> {
        let tab = self.bindings.remove(&subscriber)?;
        if let Some(subscribers) = self.by_tab.get_mut(&tab) {
            subscribers.remove(&subscriber);
            if subscribers.is_empty() {
                self.by_tab.remove(&tab);
            }
        }
        Some(tab)
    }

    pub fn tab_of(&self, subscriber: SubscriberId) -> Option<TabId> {
        self.bindings.get(&subscriber).copied()
    }

    pub fn subscriber_count(&self, tab: TabId) -> usize {
        self.by_tab.get(&tab).map_or(0, HashMap::len)
    }

    /// Deliver to every subscriber bound to `tab`. A dead subscriber's send
    /// error is swallowed; it never interrupts delivery to the rest.
    pub fn publish(&self, tab: TabId, message: &ServerMessage) {
        if let Some(subscribers) = self.by_tab.get(&tab) {
            for sender in subscribers.values() {
                let _ = sender.send(message.clone());
            }
        }
    }
}
