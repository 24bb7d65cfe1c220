//! The session coordinator: one event loop owning all per-tab state.
//!
//! Every inbound event — traffic observations, tab lifecycle changes,
//! subscriber commands, inspector continuations — funnels through a single
//! channel and its handler runs to completion before the next is taken.
//! Ledger mutation and the matching broadcast therefore happen in the same
//! turn, and subscribers never observe the two out of sync.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sitetap_core::{
    origin_of_url, CaptureOrigin, NetworkEvent, RecordPatch, RequestId, TabEvent, TabId,
    UpsertOutcome,
};

use crate::broadcaster::{Broadcaster, SubscriberId, SubscriberSender};
use crate::inspector::{InspectError, InspectionSessionManager};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::SessionRegistry;

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum Event {
    /// A traffic observation from a capture source.
    Network(NetworkEvent),
    /// Tab lifecycle change.
    Tab(TabEvent),
    /// Command from a subscriber connection, with its outbound handle.
    Command {
        subscriber: SubscriberId,
        sender: SubscriberSender,
        message: ClientMessage,
    },
    /// A subscriber connection went away.
    Disconnected { subscriber: SubscriberId },
    /// Supplementary payload fetched through the inspection session,
    /// re-entering the loop so the mutation is re-validated and serialized
    /// with everything else.
    InspectorBody {
        tab: TabId,
        request_id: RequestId,
        result: Result<(String, bool), InspectError>,
    },
}

pub struct SessionCoordinator {
    registry: SessionRegistry,
    broadcaster: Broadcaster,
    inspector: InspectionSessionManager,
    events_rx: mpsc::Receiver<Event>,
    /// Handed to spawned continuations so their results re-enter the loop.
    events_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(
        registry: SessionRegistry,
        inspector: InspectionSessionManager,
        events_rx: mpsc::Receiver<Event>,
        events_tx: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            broadcaster: Broadcaster::new(),
            inspector,
            events_rx,
            events_tx,
            cancel,
        }
    }

    /// Main event loop. Runs until the event channel is closed or the
    /// cancellation token is triggered.
    pub async fn run(&mut self) {
        info!("session coordinator: event loop started");
        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("session coordinator: event channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("session coordinator: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Network(event) => self.handle_network(event).await,
            Event::Tab(event) => self.handle_tab(event),
            Event::Command {
                subscriber,
                sender,
                message,
            } => self.handle_command(subscriber, sender, message),
            Event::Disconnected { subscriber } => self.handle_disconnect(subscriber),
            Event::InspectorBody {
                tab,
                request_id,
                result,
            } => self.handle_inspector_body(tab, request_id, result),
        }
    }

    // -- traffic ----------------------------------------------------------

    async fn handle_network(&mut self, event: NetworkEvent) {
        let NetworkEvent {
            tab,
            request_id,
            patch,
        } = event;

        let targets: Vec<TabId> = if tab.is_none() {
            // Unattributable traffic: apply to every tab on the initiator's
            // origin; with no resolvable origin the event is dropped.
            let origin = patch.initiator.as_deref().and_then(origin_of_url);
            match origin {
                Some(origin) => self.registry.origins.tabs_on(&origin),
                None => {
                    debug!(request_id = %request_id, "unattributable event without initiator origin, dropping");
                    return;
                }
            }
        } else {
            vec![tab]
        };
        if targets.is_empty() {
            debug!(request_id = %request_id, "no tab on the initiator's origin, dropping");
            return;
        }

        let wants_body = patch.completed == Some(true)
            && patch.capture != Some(CaptureOrigin::Inspector);
        let now = Utc::now();
        for target in targets {
            let outcome = self
                .registry
                .ledger
                .upsert(target, &request_id, patch.clone(), now);
            let retained = matches!(
                outcome,
                UpsertOutcome::Inserted { .. } | UpsertOutcome::Updated { .. }
            );
            self.publish_outcome(target, outcome);
            if retained && wants_body {
                self.spawn_body_fetch(target, request_id.clone()).await;
            }
        }
    }

    /// Publish the subscriber-visible effect of a ledger mutation. Runs in
    /// the same handler turn as the mutation itself.
    fn publish_outcome(&self, tab: TabId, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted { record, evicted } => {
                for request_id in evicted {
                    self.broadcaster
                        .publish(tab, &ServerMessage::RequestRemoved { request_id });
                }
                self.broadcaster
                    .publish(tab, &ServerMessage::RequestAdded { record });
            }
            UpsertOutcome::Updated { record } => {
                self.broadcaster
                    .publish(tab, &ServerMessage::RequestUpdated { record });
            }
            UpsertOutcome::Removed { request_id } => {
                self.broadcaster
                    .publish(tab, &ServerMessage::RequestRemoved { request_id });
            }
            UpsertOutcome::Dropped => {}
        }
    }

    /// Ask the inspection session for the response payload of a completed
    /// request. The result re-enters the event loop as
    /// [`Event::InspectorBody`].
    async fn spawn_body_fetch(&self, tab: TabId, request_id: RequestId) {
        if !self.inspector.is_attached(tab).await {
            return;
        }
        let inspector = self.inspector.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = inspector
                .fetch_body(tab, &request_id)
                .await
                .map(|payload| (payload.body, payload.base64));
            let _ = events
                .send(Event::InspectorBody {
                    tab,
                    request_id,
                    result,
                })
                .await;
        });
    }

    fn handle_inspector_body(
        &mut self,
        tab: TabId,
        request_id: RequestId,
        result: Result<(String, bool), InspectError>,
    ) {
        let (body, base64) = match result {
            Ok(payload) => payload,
            Err(e) => {
                debug!(%tab, request_id = %request_id, error = %e, "inspector body fetch failed");
                return;
            }
        };
        // Arbitrary events interleaved while the fetch was in flight; the
        // record must still exist before the payload is merged.
        if !self.registry.ledger.contains(tab, &request_id) {
            debug!(%tab, request_id = %request_id, "record gone before inspector payload arrived, dropping");
            return;
        }
        let patch = RecordPatch {
            response_body: Some(body),
            body_base64: Some(base64),
            capture: Some(CaptureOrigin::Inspector),
            ..Default::default()
        };
        let outcome = self.registry.ledger.upsert(tab, &request_id, patch, Utc::now());
        self.publish_outcome(tab, outcome);
    }

    // -- tab lifecycle -----------------------------------------------------

    fn handle_tab(&mut self, event: TabEvent) {
        match event {
            TabEvent::Navigated { tab, url } => {
                match origin_of_url(&url) {
                    Some(origin) => self.registry.origins.remember(tab, origin),
                    None => self.registry.origins.forget(tab),
                }
                self.registry.tab_urls.insert(tab, url);
            }
            TabEvent::Activated { tab, url } => {
                if let Some(origin) = origin_of_url(&url) {
                    self.registry.origins.remember(tab, origin);
                }
                self.registry.tab_urls.insert(tab, url);
                self.registry.active_tab = Some(tab);
            }
            TabEvent::Closed { tab } => {
                info!(%tab, "tab closed, tearing down session state");
                self.registry.drop_tab(tab);
                self.release_session(tab);
            }
        }
    }

    // -- subscriber commands -----------------------------------------------

    fn handle_command(
        &mut self,
        subscriber: SubscriberId,
        sender: SubscriberSender,
        message: ClientMessage,
    ) {
        match message {
            ClientMessage::Initialize { tab_id } => {
                self.initialize(subscriber, sender, tab_id);
            }
            ClientMessage::InitializeActive { tab_id } => {
                match self.resolve_target_tab(tab_id) {
                    Ok((tab, url)) => {
                        let _ = sender.send(ServerMessage::TabSelected { url });
                        self.initialize(subscriber, sender, tab);
                    }
                    Err(message) => {
                        debug!(subscriber, %message, "initialize_active failed");
                        let _ = sender.send(ServerMessage::InitError { message });
                    }
                }
            }
            ClientMessage::Clear => {
                let Some(tab) = self.broadcaster.tab_of(subscriber) else {
                    debug!(subscriber, "clear from unbound subscriber, ignoring");
                    return;
                };
                let dropped = self.registry.ledger.clear(tab);
                debug!(subscriber, %tab, dropped, "ledger cleared");
                self.broadcaster.publish(tab, &ServerMessage::Cleared);
            }
        }
    }

    /// Bind a subscriber to a tab, send the snapshot, and kick off the
    /// inspection-session acquisition without blocking the snapshot.
    fn initialize(&mut self, subscriber: SubscriberId, sender: SubscriberSender, tab: TabId) {
        debug!(subscriber, %tab, "subscriber initializing");
        let previous = self.broadcaster.bind(subscriber, tab, sender.clone());
        if let Some(previous) = previous {
            if previous != tab && self.broadcaster.subscriber_count(previous) == 0 {
                self.release_session(previous);
            }
        }

        let records = self.registry.ledger.list(tab);
        let _ = sender.send(ServerMessage::Init { records });

        let inspector = self.inspector.clone();
        tokio::spawn(async move {
            let message = match inspector.acquire(tab).await {
                Ok(()) => ServerMessage::ResourceReady,
                Err(e) => ServerMessage::ResourceError {
                    message: e.to_string(),
                },
            };
            let _ = sender.send(message);
        });
    }

    /// Resolve the target for `initialize_active`: the caller-supplied tab
    /// when given, otherwise the most recently active tab. The resolved tab
    /// must be an ordinary http(s) page.
    fn resolve_target_tab(&self, explicit: Option<TabId>) -> Result<(TabId, String), String> {
        let tab = explicit
            .filter(|tab| !tab.is_none())
            .or(self.registry.active_tab)
            .ok_or_else(|| "no target tab: none supplied and no active tab known".to_string())?;
        let url = self
            .registry
            .tab_urls
            .get(&tab)
            .cloned()
            .ok_or_else(|| format!("tab {tab} has no known page"))?;
        let scheme_ok = {
            let lower = url.to_ascii_lowercase();
            lower.starts_with("http://") || lower.starts_with("https://")
        };
        if !scheme_ok {
            return Err(format!("tab {tab} is not an ordinary page: {url}"));
        }
        Ok((tab, url))
    }

    fn handle_disconnect(&mut self, subscriber: SubscriberId) {
        let Some(tab) = self.broadcaster.unbind(subscriber) else {
            return;
        };
        if self.broadcaster.subscriber_count(tab) == 0 {
            debug!(subscriber, %tab, "last subscriber detached, releasing inspection session");
            self.release_session(tab);
        }
    }

    /// Best-effort release, off the event loop so a slow bridge never
    /// stalls event handling.
    fn release_session(&self, tab: TabId) {
        let inspector = self.inspector.clone();
        tokio::spawn(async move {
            inspector.release(tab).await;
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::inspector::{BodyPayload, InspectorBackend};
    use sitetap_core::{RequestFilter, RequestLedger};

    struct CountingBackend {
        attach_calls: AtomicUsize,
        detach_calls: AtomicUsize,
        fail_attach: bool,
        body: Option<String>,
    }

    impl CountingBackend {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                attach_calls: AtomicUsize::new(0),
                detach_calls: AtomicUsize::new(0),
                fail_attach: false,
                body: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                attach_calls: AtomicUsize::new(0),
                detach_calls: AtomicUsize::new(0),
                fail_attach: true,
                body: None,
            })
        }

        fn with_body(body: &str) -> Arc<Self> {
            Arc::new(Self {
                attach_calls: AtomicUsize::new(0),
                detach_calls: AtomicUsize::new(0),
                fail_attach: false,
                body: Some(body.to_string()),
            })
        }
    }

    #[async_trait]
    impl InspectorBackend for CountingBackend {
        async fn attach(&self, _tab: TabId) -> Result<(), InspectError> {
            self.attach_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_attach {
                Err(InspectError::Bridge("attach refused".into()))
            } else {
                Ok(())
            }
        }

        async fn detach(&self, _tab: TabId) -> Result<(), InspectError> {
            self.detach_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_body(
            &self,
            _tab: TabId,
            _request_id: &RequestId,
        ) -> Result<BodyPayload, InspectError> {
            match &self.body {
                Some(body) => Ok(BodyPayload {
                    body: body.clone(),
                    base64: false,
                }),
                None => Err(InspectError::Bridge("no body".into())),
            }
        }
    }

    struct TestHarness {
        events_tx: mpsc::Sender<Event>,
        cancel: CancellationToken,
        _handle: tokio::task::JoinHandle<()>,
    }

    impl TestHarness {
        fn start(backend: Arc<dyn InspectorBackend>, capacity: usize) -> Self {
            let (events_tx, events_rx) = mpsc::channel(256);
            let cancel = CancellationToken::new();
            let registry = SessionRegistry::new(RequestLedger::with_capacity(
                RequestFilter::new(),
                capacity,
            ));
            let mut coordinator = SessionCoordinator::new(
                registry,
                InspectionSessionManager::new(backend),
                events_rx,
                events_tx.clone(),
                cancel.clone(),
            );
            let handle = tokio::spawn(async move { coordinator.run().await });
            Self {
                events_tx,
                cancel,
                _handle: handle,
            }
        }

        async fn send(&self, event: Event) {
            self.events_tx.send(event).await.expect("coordinator alive");
        }

        /// Attach a subscriber: send `initialize` and return its outbound
        /// receiver after consuming nothing.
        async fn subscribe(
            &self,
            subscriber: SubscriberId,
            tab: TabId,
        ) -> mpsc::UnboundedReceiver<ServerMessage> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.send(Event::Command {
                subscriber,
                sender: tx,
                message: ClientMessage::Initialize { tab_id: tab },
            })
            .await;
            rx
        }
    }

    impl Drop for TestHarness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for message")
            .expect("channel closed")
    }

    fn network(tab: i64, request_id: &str, patch: RecordPatch) -> Event {
        Event::Network(NetworkEvent {
            tab: TabId(tab),
            request_id: request_id.to_string(),
            patch,
        })
    }

    fn matching_patch(tag: &str) -> RecordPatch {
        RecordPatch {
            url: Some(format!(
                "https://chatgpt.com/backend-api/conversation/{tag}"
            )),
            method: Some("GET".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn initialize_sends_snapshot_then_resource_ready() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        harness.send(network(1, "r-1", matching_patch("a"))).await;

        let mut rx = harness.subscribe(1, TabId(1)).await;

        let ServerMessage::Init { records } = recv(&mut rx).await else {
            panic!("expected init first");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id, "r-1");

        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));
    }

    #[tokio::test]
    async fn failed_acquire_reports_resource_error_and_keeps_session() {
        let harness = TestHarness::start(CountingBackend::failing(), 500);
        let mut rx = harness.subscribe(1, TabId(1)).await;

        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        let ServerMessage::ResourceError { message } = recv(&mut rx).await else {
            panic!("expected resource_error");
        };
        assert!(message.contains("attach refused"));

        // The failure is non-fatal: the subscriber still receives mutations.
        harness.send(network(1, "r-1", matching_patch("a"))).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::RequestAdded { .. }));
    }

    #[tokio::test]
    async fn insert_then_merge_publishes_added_and_updated() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        let mut rx = harness.subscribe(1, TabId(1)).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));

        harness.send(network(1, "a", matching_patch("x"))).await;
        let ServerMessage::RequestAdded { record } = recv(&mut rx).await else {
            panic!("expected request_added");
        };
        assert_eq!(record.method, "GET");
        assert!(!record.completed);

        harness
            .send(network(
                1,
                "a",
                RecordPatch {
                    status_code: Some(200),
                    completed: Some(true),
                    ..Default::default()
                },
            ))
            .await;
        let ServerMessage::RequestUpdated { record } = recv(&mut rx).await else {
            panic!("expected request_updated");
        };
        assert_eq!(record.method, "GET", "merge keeps earlier fields");
        assert_eq!(record.status_code, Some(200));
        assert!(record.completed);
    }

    #[tokio::test]
    async fn reclassified_record_publishes_removed() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        let mut rx = harness.subscribe(1, TabId(1)).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));

        harness.send(network(1, "a", matching_patch("x"))).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::RequestAdded { .. }));

        harness
            .send(network(
                1,
                "a",
                RecordPatch {
                    url: Some("https://chatgpt.com/irrelevant".into()),
                    ..Default::default()
                },
            ))
            .await;
        let ServerMessage::RequestRemoved { request_id } = recv(&mut rx).await else {
            panic!("expected request_removed");
        };
        assert_eq!(request_id, "a");
    }

    #[tokio::test]
    async fn filter_miss_on_create_is_silent() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        let mut rx = harness.subscribe(1, TabId(1)).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));

        harness
            .send(network(
                1,
                "a",
                RecordPatch {
                    url: Some("https://cdn.example.com/app.js".into()),
                    ..Default::default()
                },
            ))
            .await;
        // Nothing is published; the next matching event is the next message.
        harness.send(network(1, "b", matching_patch("x"))).await;
        let ServerMessage::RequestAdded { record } = recv(&mut rx).await else {
            panic!("expected request_added for the matching event");
        };
        assert_eq!(record.request_id, "b");
    }

    #[tokio::test]
    async fn eviction_publishes_removed_for_oldest() {
        let harness = TestHarness::start(CountingBackend::ok(), 2);
        let mut rx = harness.subscribe(1, TabId(1)).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));

        for id in ["a", "b", "c"] {
            harness.send(network(1, id, matching_patch(id))).await;
        }

        assert!(matches!(recv(&mut rx).await, ServerMessage::RequestAdded { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::RequestAdded { .. }));
        // Third insert overflows capacity 2: oldest is removed, then added.
        let ServerMessage::RequestRemoved { request_id } = recv(&mut rx).await else {
            panic!("expected eviction removal");
        };
        assert_eq!(request_id, "a");
        let ServerMessage::RequestAdded { record } = recv(&mut rx).await else {
            panic!("expected request_added");
        };
        assert_eq!(record.request_id, "c");
    }

    #[tokio::test]
    async fn clear_fans_out_to_every_subscriber_once() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        let mut rx1 = harness.subscribe(1, TabId(1)).await;
        let mut rx2 = harness.subscribe(2, TabId(1)).await;
        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(recv(rx).await, ServerMessage::Init { .. }));
            assert!(matches!(recv(rx).await, ServerMessage::ResourceReady));
        }

        harness.send(network(1, "a", matching_patch("x"))).await;
        assert!(matches!(recv(&mut rx1).await, ServerMessage::RequestAdded { .. }));
        assert!(matches!(recv(&mut rx2).await, ServerMessage::RequestAdded { .. }));

        let (tx, _keep) = mpsc::unbounded_channel();
        harness
            .send(Event::Command {
                subscriber: 1,
                sender: tx,
                message: ClientMessage::Clear,
            })
            .await;

        assert!(matches!(recv(&mut rx1).await, ServerMessage::Cleared));
        assert!(matches!(recv(&mut rx2).await, ServerMessage::Cleared));

        // A re-initialize sees an empty ledger.
        let mut rx3 = harness.subscribe(3, TabId(1)).await;
        let ServerMessage::Init { records } = recv(&mut rx3).await else {
            panic!("expected init");
        };
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn unattributed_event_fans_out_by_origin() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        harness
            .send(Event::Tab(TabEvent::Navigated {
                tab: TabId(1),
                url: "https://chatgpt.com/c/one".into(),
            }))
            .await;
        harness
            .send(Event::Tab(TabEvent::Navigated {
                tab: TabId(2),
                url: "https://chatgpt.com/c/two".into(),
            }))
            .await;
        harness
            .send(Event::Tab(TabEvent::Navigated {
                tab: TabId(3),
                url: "https://example.com/".into(),
            }))
            .await;

        let mut rx1 = harness.subscribe(1, TabId(1)).await;
        let mut rx2 = harness.subscribe(2, TabId(2)).await;
        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(recv(rx).await, ServerMessage::Init { .. }));
            assert!(matches!(recv(rx).await, ServerMessage::ResourceReady));
        }

        let mut patch = matching_patch("bg");
        patch.initiator = Some("https://chatgpt.com/c/one".into());
        harness.send(network(-1, "bg-1", patch)).await;

        // Both chatgpt.com tabs receive the record; the example.com tab's
        // ledger is untouched.
        let ServerMessage::RequestAdded { record } = recv(&mut rx1).await else {
            panic!("expected request_added on tab 1");
        };
        assert_eq!(record.tab, TabId(1));
        let ServerMessage::RequestAdded { record } = recv(&mut rx2).await else {
            panic!("expected request_added on tab 2");
        };
        assert_eq!(record.tab, TabId(2));

        let mut rx3 = harness.subscribe(3, TabId(3)).await;
        let ServerMessage::Init { records } = recv(&mut rx3).await else {
            panic!("expected init");
        };
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn unattributed_event_without_origin_is_dropped() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        let mut rx = harness.subscribe(1, TabId(1)).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));

        harness.send(network(-1, "bg-1", matching_patch("bg"))).await;
        harness.send(network(1, "a", matching_patch("x"))).await;

        let ServerMessage::RequestAdded { record } = recv(&mut rx).await else {
            panic!("expected request_added");
        };
        assert_eq!(record.request_id, "a", "unattributed event must not surface");
    }

    #[tokio::test]
    async fn initialize_active_falls_back_to_active_tab() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        harness
            .send(Event::Tab(TabEvent::Activated {
                tab: TabId(5),
                url: "https://chatgpt.com/c/abc".into(),
            }))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        harness
            .send(Event::Command {
                subscriber: 1,
                sender: tx,
                message: ClientMessage::InitializeActive { tab_id: None },
            })
            .await;

        let ServerMessage::TabSelected { url } = recv(&mut rx).await else {
            panic!("expected tab_selected");
        };
        assert_eq!(url, "https://chatgpt.com/c/abc");
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
    }

    #[tokio::test]
    async fn initialize_active_rejects_when_nothing_resolvable() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        let (tx, mut rx) = mpsc::unbounded_channel();
        harness
            .send(Event::Command {
                subscriber: 1,
                sender: tx,
                message: ClientMessage::InitializeActive { tab_id: None },
            })
            .await;

        assert!(matches!(recv(&mut rx).await, ServerMessage::InitError { .. }));
    }

    #[tokio::test]
    async fn initialize_active_rejects_non_http_page() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        harness
            .send(Event::Tab(TabEvent::Activated {
                tab: TabId(5),
                url: "chrome://settings".into(),
            }))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        harness
            .send(Event::Command {
                subscriber: 1,
                sender: tx,
                message: ClientMessage::InitializeActive { tab_id: None },
            })
            .await;

        let ServerMessage::InitError { message } = recv(&mut rx).await else {
            panic!("expected init_error");
        };
        assert!(message.contains("not an ordinary page"));
    }

    #[tokio::test]
    async fn last_disconnect_releases_inspection_session() {
        let backend = CountingBackend::ok();
        let harness = TestHarness::start(backend.clone(), 500);

        let mut rx1 = harness.subscribe(1, TabId(1)).await;
        let mut rx2 = harness.subscribe(2, TabId(1)).await;
        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(recv(rx).await, ServerMessage::Init { .. }));
            assert!(matches!(recv(rx).await, ServerMessage::ResourceReady));
        }

        harness.send(Event::Disconnected { subscriber: 1 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            backend.detach_calls.load(Ordering::SeqCst),
            0,
            "a subscriber remains, session stays attached"
        );

        harness.send(Event::Disconnected { subscriber: 2 }).await;
        for _ in 0..200 {
            if backend.detach_calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backend.detach_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tab_close_tears_down_and_releases() {
        let backend = CountingBackend::ok();
        let harness = TestHarness::start(backend.clone(), 500);

        let mut rx = harness.subscribe(1, TabId(1)).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));
        harness.send(network(1, "a", matching_patch("x"))).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::RequestAdded { .. }));

        harness.send(Event::Tab(TabEvent::Closed { tab: TabId(1) })).await;
        for _ in 0..200 {
            if backend.detach_calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backend.detach_calls.load(Ordering::SeqCst), 1);

        let mut rx2 = harness.subscribe(2, TabId(1)).await;
        let ServerMessage::Init { records } = recv(&mut rx2).await else {
            panic!("expected init");
        };
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn inspector_body_merges_into_existing_record() {
        let backend = CountingBackend::with_body("{\"items\":[]}");
        let harness = TestHarness::start(backend, 500);
        let mut rx = harness.subscribe(1, TabId(1)).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));

        harness.send(network(1, "a", matching_patch("x"))).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::RequestAdded { .. }));

        harness
            .send(network(
                1,
                "a",
                RecordPatch {
                    completed: Some(true),
                    ..Default::default()
                },
            ))
            .await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::RequestUpdated { .. }));

        // The spawned fetch re-enters the loop and merges the payload.
        let ServerMessage::RequestUpdated { record } = recv(&mut rx).await else {
            panic!("expected the inspector payload update");
        };
        assert_eq!(record.response_body.as_deref(), Some("{\"items\":[]}"));
        assert_eq!(record.capture, CaptureOrigin::Inspector);
        assert_eq!(record.method, "GET", "interception fields survive the merge");
    }

    #[tokio::test]
    async fn inspector_body_for_missing_record_is_dropped() {
        let harness = TestHarness::start(CountingBackend::ok(), 500);
        let mut rx = harness.subscribe(1, TabId(1)).await;
        assert!(matches!(recv(&mut rx).await, ServerMessage::Init { .. }));
        assert!(matches!(recv(&mut rx).await, ServerMessage::ResourceReady));

        harness
            .send(Event::InspectorBody {
                tab: TabId(1),
                request_id: "ghost".into(),
                result: Ok(("late".into(), false)),
            })
            .await;
        harness.send(network(1, "a", matching_patch("x"))).await;

        let ServerMessage::RequestAdded { record } = recv(&mut rx).await else {
            panic!("expected request_added");
        };
        assert_eq!(record.request_id, "a", "stale payload must not resurrect a record");
    }
}
