//! Upgrade coordinator: walks each instance through
//! `Unresolved → PortCreated → RealmInstantiated → AttributesDelivered →
//! Connected → Resolved`, plus the `Disconnected` grace window and disposal.
//!
//! The coordinator never blocks on a realm. Steps that need a realm reply
//! (construction, `connect` delivery) park the instance until the matching
//! [`RealmEvent`] is handed to [`UpgradeCoordinator::handle_event`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::channel::{self, ChannelEndpoint, ChannelId, ChannelMessage, MessageKind};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::host::{ElementId, HostPort, HostProxy, UpgradeState};
use crate::realm::{RealmEvent, RealmHandle, RealmPool};
use crate::registry::ElementDefinition;
use crate::sync::{initial_batch, AttributeSyncEngine, DisconnectedAttributePolicy};

struct UpgradeTask {
    definition: Arc<ElementDefinition>,
    /// Realm side of the channel, held until a realm takes it.
    realm_endpoint: Option<ChannelEndpoint>,
    reported_unavailable: bool,
}

struct LiveInstance {
    definition: Arc<ElementDefinition>,
    channel: ChannelId,
    realm: Option<RealmHandle>,
    awaiting_construct: bool,
    /// Lifecycle/attribute messages sent but not yet acknowledged.
    unacked: usize,
    /// `connect` messages sent but not yet acknowledged. Only the last one
    /// resolves the element.
    unacked_connects: usize,
    grace_deadline: Option<Instant>,
}

pub struct UpgradeCoordinator {
    pool: RealmPool,
    diagnostics: Arc<dyn DiagnosticsSink>,
    grace_window: Duration,
    disconnected_attributes: DisconnectedAttributePolicy,
    sync: AttributeSyncEngine,
    queue: VecDeque<ElementId>,
    tasks: HashMap<ElementId, UpgradeTask>,
    instances: HashMap<ElementId, LiveInstance>,
    failed: HashSet<ElementId>,
    replies_tx: mpsc::UnboundedSender<RealmEvent>,
    replies_rx: mpsc::UnboundedReceiver<RealmEvent>,
}

impl UpgradeCoordinator {
    pub fn new(pool: RealmPool, config: &EngineConfig) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            diagnostics: Arc::clone(pool.registry().diagnostics()),
            pool,
            grace_window: config.grace_window(),
            disconnected_attributes: config.disconnected_attributes,
            sync: AttributeSyncEngine::new(),
            queue: VecDeque::new(),
            tasks: HashMap::new(),
            instances: HashMap::new(),
            failed: HashSet::new(),
            replies_tx,
            replies_rx,
        }
    }

    pub fn pool(&self) -> &RealmPool {
        &self.pool
    }

    pub fn sync(&self) -> &AttributeSyncEngine {
        &self.sync
    }

    pub fn is_pending(&self, element: ElementId) -> bool {
        self.tasks.contains_key(&element)
    }

    pub fn realm_of(&self, element: ElementId) -> Option<&RealmHandle> {
        self.instances.get(&element)?.realm.as_ref()
    }

    pub fn awaiting_replies(&self) -> bool {
        self.instances
            .values()
            .any(|instance| instance.awaiting_construct || instance.unacked > 0)
    }

    /// Queue `proxy` for upgrade. Returns `false` if it is already queued, past
    /// `Unresolved`, or its construction failed before.
    pub fn enqueue(&mut self, proxy: &mut HostProxy, definition: Arc<ElementDefinition>) -> bool {
        if self.tasks.contains_key(&proxy.id) || self.failed.contains(&proxy.id) {
            return false;
        }
        if !matches!(proxy.state, UpgradeState::Unresolved | UpgradeState::Disposed) {
            return false;
        }

        proxy.state = UpgradeState::Unresolved;
        self.tasks.insert(
            proxy.id,
            UpgradeTask {
                definition,
                realm_endpoint: None,
                reported_unavailable: false,
            },
        );
        self.queue.push_back(proxy.id);
        debug!(element = %proxy.id, tag = %proxy.tag_name, "enqueued");
        true
    }

    /// Start every queued upgrade, in enqueue order. Upgrades that cannot get
    /// a realm yet stay queued for the next call.
    pub fn run_queue(&mut self, elements: &mut BTreeMap<ElementId, HostProxy>) {
        let mut stalled = VecDeque::new();
        while let Some(id) = self.queue.pop_front() {
            match elements.get_mut(&id) {
                Some(proxy) => {
                    if !self.begin(proxy) {
                        stalled.push_back(id);
                    }
                }
                None => {
                    self.tasks.remove(&id);
                }
            }
        }
        self.queue = stalled;
    }

    /// Create the port, then hand the realm endpoint to a realm. Returns `false`
    /// when no realm could be assigned.
    fn begin(&mut self, proxy: &mut HostProxy) -> bool {
        let id = proxy.id;
        let Some(task) = self.tasks.get_mut(&id) else {
            return true;
        };

        if proxy.state == UpgradeState::Unresolved {
            let (host, realm) = channel::open();
            let channel = host.id();
            proxy.port = Some(HostPort::new(host, id, Arc::clone(&self.diagnostics)));
            proxy.state = UpgradeState::PortCreated;
            task.realm_endpoint = Some(realm);
            self.instances.insert(
                id,
                LiveInstance {
                    definition: Arc::clone(&task.definition),
                    channel,
                    realm: None,
                    awaiting_construct: false,
                    unacked: 0,
                    unacked_connects: 0,
                    grace_deadline: None,
                },
            );
            debug!(element = %id, %channel, "port created");
        }

        let Some(endpoint) = task.realm_endpoint.take() else {
            return true;
        };
        let realm = match self.pool.acquire(&task.definition) {
            Ok(realm) => realm,
            Err(error) => {
                task.realm_endpoint = Some(endpoint);
                if !task.reported_unavailable {
                    task.reported_unavailable = true;
                    self.diagnostics.report(Diagnostic::RealmUnavailable {
                        element: id,
                        reason: error.to_string(),
                    });
                }
                return false;
            }
        };

        if !realm.construct(id, &proxy.tag_name, endpoint, self.replies_tx.clone()) {
            self.pool.release(realm.id());
            self.fail(proxy, format!("{} is not running", realm.id()));
            return true;
        }
        debug!(element = %id, realm = %realm.id(), "construct requested");
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.realm = Some(realm);
            instance.awaiting_construct = true;
        }
        true
    }

    pub(crate) fn handle_event(
        &mut self,
        event: RealmEvent,
        elements: &mut BTreeMap<ElementId, HostProxy>,
    ) {
        match event {
            RealmEvent::Constructed { element, channel } => {
                if !self.is_current(element, channel) {
                    return;
                }
                if let Some(proxy) = elements.get_mut(&element) {
                    self.instantiated(proxy);
                }
            }
            RealmEvent::ConstructFailed {
                element,
                channel,
                reason,
            } => {
                if !self.is_current(element, channel) {
                    return;
                }
                if let Some(proxy) = elements.get_mut(&element) {
                    self.fail(proxy, reason);
                }
            }
            RealmEvent::Delivered {
                element,
                channel,
                kind,
            } => {
                if !self.is_current(element, channel) {
                    return;
                }
                let Some(instance) = self.instances.get_mut(&element) else {
                    return;
                };
                if kind != MessageKind::UserMessage {
                    instance.unacked = instance.unacked.saturating_sub(1);
                }
                if kind != MessageKind::Connect {
                    return;
                }
                instance.unacked_connects = instance.unacked_connects.saturating_sub(1);
                if instance.unacked_connects > 0 {
                    return;
                }
                if let Some(proxy) = elements.get_mut(&element) {
                    if proxy.state == UpgradeState::Connected {
                        proxy.state = UpgradeState::Resolved;
                        proxy.resolved = true;
                        self.tasks.remove(&element);
                        info!(%element, tag = %proxy.tag_name, "resolved");
                    }
                }
            }
        }
    }

    fn is_current(&self, element: ElementId, channel: ChannelId) -> bool {
        self.instances
            .get(&element)
            .is_some_and(|instance| instance.channel == channel)
    }

    /// Realm instance exists: deliver the initial batch, then `connect` if the
    /// element is already in the tree.
    fn instantiated(&mut self, proxy: &mut HostProxy) {
        let Some(instance) = self.instances.get_mut(&proxy.id) else {
            return;
        };
        if proxy.state != UpgradeState::PortCreated {
            return;
        }
        instance.awaiting_construct = false;
        proxy.state = UpgradeState::RealmInstantiated;
        debug!(element = %proxy.id, "realm instance created");

        let definition = Arc::clone(&instance.definition);
        let entries = initial_batch(&definition, &proxy.attributes);
        self.sync.discard(proxy.id);
        if !entries.is_empty() {
            self.send(proxy, ChannelMessage::AttrBatch { entries });
        }
        proxy.state = UpgradeState::AttributesDelivered;
        debug!(element = %proxy.id, "initial attributes delivered");

        if proxy.connected {
            self.send(proxy, ChannelMessage::Connect);
            proxy.state = UpgradeState::Connected;
        }
    }

    fn fail(&mut self, proxy: &mut HostProxy, reason: String) {
        self.diagnostics.report(Diagnostic::ConstructFailed {
            element: proxy.id,
            tag_name: proxy.tag_name.clone(),
            reason,
        });
        self.release_instance(proxy);
        proxy.state = UpgradeState::Unresolved;
        self.failed.insert(proxy.id);
    }

    fn send(&mut self, proxy: &HostProxy, message: ChannelMessage) {
        let Some(port) = proxy.port.as_ref() else {
            return;
        };
        let kind = message.kind();
        if port.send(message) {
            if let Some(instance) = self.instances.get_mut(&proxy.id) {
                instance.unacked += 1;
                if kind == MessageKind::Connect {
                    instance.unacked_connects += 1;
                }
            }
        }
    }

    pub fn attribute_changed(&mut self, proxy: &HostProxy, name: &str, previous: Option<&str>) {
        if !proxy.state.is_upgraded() {
            return;
        }
        if let Some(instance) = self.instances.get(&proxy.id) {
            self.sync
                .record(proxy.id, &instance.definition, name, previous);
        }
    }

    /// Deliver this tick's attribute batches. Returns the tick number.
    pub fn flush_attributes(&mut self, elements: &mut BTreeMap<ElementId, HostProxy>) -> u64 {
        let tick = self.sync.advance();
        for element in self.sync.pending_elements() {
            let (Some(proxy), Some(instance)) =
                (elements.get(&element), self.instances.get(&element))
            else {
                self.sync.discard(element);
                continue;
            };
            match proxy.state {
                UpgradeState::AttributesDelivered
                | UpgradeState::Connected
                | UpgradeState::Resolved => {}
                UpgradeState::Disconnected
                    if self.disconnected_attributes == DisconnectedAttributePolicy::Deliver => {}
                UpgradeState::Disconnected => continue,
                _ => {
                    self.sync.discard(element);
                    continue;
                }
            }

            let definition = Arc::clone(&instance.definition);
            let entries = self.sync.take_batch(element, &definition, &proxy.attributes);
            if !entries.is_empty() {
                debug!(%element, tick, entries = entries.len(), "attribute batch");
                self.send(proxy, ChannelMessage::AttrBatch { entries });
            }
        }
        tick
    }

    /// Insertion into the document, first time or within the grace window.
    pub fn connected(&mut self, proxy: &mut HostProxy, now: Instant) {
        match proxy.state {
            UpgradeState::AttributesDelivered => {
                self.send(proxy, ChannelMessage::Connect);
                proxy.state = UpgradeState::Connected;
            }
            UpgradeState::Disconnected => {
                let expired = self
                    .instances
                    .get(&proxy.id)
                    .and_then(|instance| instance.grace_deadline)
                    .is_some_and(|deadline| deadline <= now);
                if expired {
                    self.dispose(proxy);
                    return;
                }

                if let Some(instance) = self.instances.get_mut(&proxy.id) {
                    instance.grace_deadline = None;
                    let definition = Arc::clone(&instance.definition);
                    let entries = self.sync.take_batch(proxy.id, &definition, &proxy.attributes);
                    if !entries.is_empty() {
                        self.send(proxy, ChannelMessage::AttrBatch { entries });
                    }
                }
                self.send(proxy, ChannelMessage::Connect);
                proxy.state = UpgradeState::Connected;
                debug!(element = %proxy.id, "reconnected within grace window");
            }
            _ => {}
        }
    }

    /// Removal from the document opens the grace window.
    pub fn disconnected(&mut self, proxy: &mut HostProxy, now: Instant) {
        if !matches!(
            proxy.state,
            UpgradeState::Connected | UpgradeState::Resolved
        ) {
            return;
        }
        self.send(proxy, ChannelMessage::Disconnect);
        proxy.state = UpgradeState::Disconnected;
        if let Some(instance) = self.instances.get_mut(&proxy.id) {
            instance.grace_deadline = Some(now + self.grace_window);
        }
        debug!(element = %proxy.id, "disconnected, grace window open");
    }

    pub fn expire(&mut self, elements: &mut BTreeMap<ElementId, HostProxy>, now: Instant) {
        let expired: Vec<_> = self
            .instances
            .iter()
            .filter(|(_, instance)| instance.grace_deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(proxy) = elements.get_mut(&id) {
                debug!(element = %id, "grace window elapsed");
                self.dispose(proxy);
            }
        }
    }

    /// Tear the instance down from whatever state it is in.
    pub fn dispose(&mut self, proxy: &mut HostProxy) {
        self.tasks.remove(&proxy.id);
        self.failed.remove(&proxy.id);
        self.queue.retain(|queued| *queued != proxy.id);
        self.release_instance(proxy);
        proxy.state = UpgradeState::Disposed;
        proxy.resolved = false;
        debug!(element = %proxy.id, "disposed");
    }

    /// Close the channel and hand the realm reference back. A realm that was
    /// already asked to construct is told to release the instance.
    fn release_instance(&mut self, proxy: &mut HostProxy) {
        self.tasks.remove(&proxy.id);
        self.sync.discard(proxy.id);
        if let Some(instance) = self.instances.remove(&proxy.id) {
            if let Some(realm) = instance.realm {
                realm.release(proxy.id, instance.channel);
                self.pool.release(realm.id());
            }
        }
        if let Some(port) = proxy.port.take() {
            port.close();
        }
    }

    pub(crate) fn try_next_event(&mut self) -> Option<RealmEvent> {
        self.replies_rx.try_recv().ok()
    }

    pub(crate) async fn next_event(&mut self) -> Option<RealmEvent> {
        self.replies_rx.recv().await
    }
}
