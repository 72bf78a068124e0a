use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::channel::{ChannelEndpoint, ChannelId, ChannelMessage};
use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::sync::AttributeMap;

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide element id. Realms shared between documents key their
/// instances by it, so two documents never hand out the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

/// Lifecycle of a component instance as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    Unresolved,
    PortCreated,
    RealmInstantiated,
    AttributesDelivered,
    Connected,
    Resolved,
    Disconnected,
    Disposed,
}

impl UpgradeState {
    /// Whether the initial attribute delivery has happened and the instance
    /// is still alive, i.e. later mutations go through the sync engine.
    pub fn is_upgraded(self) -> bool {
        matches!(
            self,
            Self::AttributesDelivered | Self::Connected | Self::Resolved | Self::Disconnected
        )
    }
}

/// Child of a host element, as far as the light tree view exposes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightNode {
    Element { tag_name: String },
    Text(String),
}

/// Host-side endpoint of an instance's channel (the element's `port`).
pub struct HostPort {
    endpoint: ChannelEndpoint,
    element: ElementId,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl fmt::Debug for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPort")
            .field("channel", &self.endpoint.id())
            .field("element", &self.element)
            .field("open", &self.endpoint.is_open())
            .finish()
    }
}

impl HostPort {
    pub(crate) fn new(
        endpoint: ChannelEndpoint,
        element: ElementId,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        Self {
            endpoint,
            element,
            diagnostics,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.endpoint.id()
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.is_open()
    }

    /// Send a `userMessage` to the realm side. On a closed channel the message
    /// is dropped and reported to diagnostics.
    pub fn post_message(&self, payload: Value) {
        self.send(ChannelMessage::UserMessage { payload });
    }

    pub(crate) fn send(&self, message: ChannelMessage) -> bool {
        let kind = message.kind();
        match self.endpoint.send(message) {
            Ok(()) => true,
            Err(_) => {
                self.diagnostics.report(Diagnostic::ChannelClosed {
                    element: self.element,
                    kind,
                });
                false
            }
        }
    }

    /// Next `userMessage` payload posted by the realm side, if one is queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        while let Some(message) = self.endpoint.try_recv() {
            if let Some(payload) = self.user_payload(message) {
                return Some(payload);
            }
        }
        None
    }

    pub async fn recv(&mut self) -> Option<Value> {
        while let Some(message) = self.endpoint.recv().await {
            if let Some(payload) = self.user_payload(message) {
                return Some(payload);
            }
        }
        None
    }

    fn user_payload(&self, message: ChannelMessage) -> Option<Value> {
        match message {
            ChannelMessage::UserMessage { payload } => Some(payload),
            other => {
                tracing::warn!(
                    element = %self.element,
                    kind = %other.kind(),
                    "ignoring lifecycle message sent by realm"
                );
                None
            }
        }
    }

    pub(crate) fn close(&self) {
        self.endpoint.close();
    }
}

/// DOM-visible side of a component instance.
#[derive(Debug)]
pub struct HostProxy {
    pub(crate) id: ElementId,
    pub(crate) tag_name: String,
    pub(crate) state: UpgradeState,
    pub(crate) attributes: AttributeMap,
    pub(crate) port: Option<HostPort>,
    pub(crate) connected: bool,
    pub(crate) resolved: bool,
    pub(crate) connection_order: Option<u64>,
    pub(crate) light_tree: Vec<LightNode>,
}

impl HostProxy {
    pub(crate) fn new(id: ElementId, tag_name: String) -> Self {
        Self {
            id,
            tag_name,
            state: UpgradeState::Unresolved,
            attributes: AttributeMap::new(),
            port: None,
            connected: false,
            resolved: false,
            connection_order: None,
            light_tree: Vec::new(),
        }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// `:resolved` in selector terms.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    pub fn port(&self) -> Option<&HostPort> {
        self.port.as_ref()
    }

    pub fn port_mut(&mut self) -> Option<&mut HostPort> {
        self.port.as_mut()
    }

    pub fn light_tree(&self) -> &[LightNode] {
        &self.light_tree
    }

    pub(crate) fn set_attribute(&mut self, name: &str, value: String) -> Option<String> {
        self.attributes.insert(name.to_string(), value)
    }

    pub(crate) fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.shift_remove(name)
    }
}
