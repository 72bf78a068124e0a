use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use super::proxy::{ElementId, HostPort, HostProxy, LightNode, UpgradeState};
use crate::config::EngineConfig;
use crate::realm::RealmPool;
use crate::registry::{ElementDefinition, Registry, RegistryError};
use crate::upgrade::UpgradeCoordinator;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("unknown element {0}")]
    UnknownElement(ElementId),
    #[error("{0:?} is not a valid attribute name")]
    InvalidAttributeName(String),
}

/// Host realm document: owns the host proxies and drives their upgrades.
///
/// The document is single-threaded and cooperative. Realm replies are only
/// applied inside [`Document::pump`], [`Document::tick`] and
/// [`Document::settle`].
pub struct Document {
    registry: Arc<Registry>,
    coordinator: UpgradeCoordinator,
    elements: BTreeMap<ElementId, HostProxy>,
    definitions: broadcast::Receiver<Arc<ElementDefinition>>,
    next_connection: u64,
}

impl Document {
    pub fn new(pool: RealmPool, config: &EngineConfig) -> Self {
        let registry = Arc::clone(pool.registry());
        let definitions = registry.subscribe();
        Self {
            registry,
            coordinator: UpgradeCoordinator::new(pool, config),
            elements: BTreeMap::new(),
            definitions,
            next_connection: 0,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &UpgradeCoordinator {
        &self.coordinator
    }

    /// Register a module and immediately enqueue matching elements of this
    /// document. Other documents pick the new tags up on their next pump.
    pub async fn register_module(
        &mut self,
        url: &Url,
    ) -> Result<Vec<Arc<ElementDefinition>>, RegistryError> {
        let definitions = self.registry.register_module(url).await?;
        self.adopt_definitions();
        Ok(definitions)
    }

    pub fn create_element(&mut self, tag_name: &str) -> ElementId {
        let proxy = self.new_proxy(tag_name);
        self.insert(proxy)
    }

    /// Create an element that already carries `attributes`, as the parser
    /// would. Defined tags are enqueued for upgrade right away.
    pub fn create_element_with<I, K, V>(
        &mut self,
        tag_name: &str,
        attributes: I,
    ) -> Result<ElementId, DocumentError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut proxy = self.new_proxy(tag_name);
        for (name, value) in attributes {
            let name = name.as_ref();
            validate_attribute_name(name)?;
            proxy.set_attribute(name, value.into());
        }
        Ok(self.insert(proxy))
    }

    fn new_proxy(&self, tag_name: &str) -> HostProxy {
        HostProxy::new(ElementId::next(), tag_name.to_ascii_lowercase())
    }

    fn insert(&mut self, mut proxy: HostProxy) -> ElementId {
        let id = proxy.id;
        if let Some(definition) = self.registry.lookup(&proxy.tag_name) {
            self.coordinator.enqueue(&mut proxy, definition);
        }
        self.elements.insert(id, proxy);
        self.coordinator.run_queue(&mut self.elements);
        id
    }

    pub fn element(&self, id: ElementId) -> Result<&HostProxy, DocumentError> {
        self.elements.get(&id).ok_or(DocumentError::UnknownElement(id))
    }

    fn element_mut(&mut self, id: ElementId) -> Result<&mut HostProxy, DocumentError> {
        self.elements
            .get_mut(&id)
            .ok_or(DocumentError::UnknownElement(id))
    }

    pub fn state(&self, id: ElementId) -> Result<UpgradeState, DocumentError> {
        Ok(self.element(id)?.state())
    }

    pub fn is_resolved(&self, id: ElementId) -> Result<bool, DocumentError> {
        Ok(self.element(id)?.is_resolved())
    }

    pub fn port_mut(&mut self, id: ElementId) -> Result<Option<&mut HostPort>, DocumentError> {
        Ok(self.element_mut(id)?.port_mut())
    }

    pub fn post_message(&self, id: ElementId, payload: Value) -> Result<(), DocumentError> {
        if let Some(port) = self.element(id)?.port() {
            port.post_message(payload);
        }
        Ok(())
    }

    pub fn get_attribute(&self, id: ElementId, name: &str) -> Result<Option<&str>, DocumentError> {
        Ok(self.element(id)?.get_attribute(name))
    }

    pub fn set_attribute(
        &mut self,
        id: ElementId,
        name: &str,
        value: impl Into<String>,
    ) -> Result<(), DocumentError> {
        validate_attribute_name(name)?;
        let proxy = self
            .elements
            .get_mut(&id)
            .ok_or(DocumentError::UnknownElement(id))?;
        let previous = proxy.set_attribute(name, value.into());
        self.coordinator
            .attribute_changed(proxy, name, previous.as_deref());
        Ok(())
    }

    pub fn remove_attribute(
        &mut self,
        id: ElementId,
        name: &str,
    ) -> Result<Option<String>, DocumentError> {
        let proxy = self
            .elements
            .get_mut(&id)
            .ok_or(DocumentError::UnknownElement(id))?;
        let previous = proxy.remove_attribute(name);
        if previous.is_some() {
            self.coordinator
                .attribute_changed(proxy, name, previous.as_deref());
        }
        Ok(previous)
    }

    pub fn append_child(&mut self, id: ElementId, node: LightNode) -> Result<(), DocumentError> {
        self.element_mut(id)?.light_tree.push(node);
        Ok(())
    }

    pub fn connect(&mut self, id: ElementId) -> Result<(), DocumentError> {
        let order = self.next_connection;
        let proxy = self
            .elements
            .get_mut(&id)
            .ok_or(DocumentError::UnknownElement(id))?;
        if proxy.connected {
            return Ok(());
        }
        self.next_connection += 1;
        proxy.connected = true;
        proxy.connection_order = Some(order);

        self.coordinator.connected(proxy, Instant::now());
        if matches!(proxy.state, UpgradeState::Unresolved | UpgradeState::Disposed) {
            if let Some(definition) = self.registry.lookup(&proxy.tag_name) {
                self.coordinator.enqueue(proxy, definition);
            }
        }
        self.coordinator.run_queue(&mut self.elements);
        Ok(())
    }

    pub fn disconnect(&mut self, id: ElementId) -> Result<(), DocumentError> {
        let proxy = self
            .elements
            .get_mut(&id)
            .ok_or(DocumentError::UnknownElement(id))?;
        if !proxy.connected {
            return Ok(());
        }
        proxy.connected = false;
        self.coordinator.disconnected(proxy, Instant::now());
        Ok(())
    }

    /// Destroy the host proxy, disposing its instance unconditionally.
    pub fn destroy(&mut self, id: ElementId) -> Result<(), DocumentError> {
        let mut proxy = self
            .elements
            .remove(&id)
            .ok_or(DocumentError::UnknownElement(id))?;
        self.coordinator.dispose(&mut proxy);
        Ok(())
    }

    pub fn teardown(&mut self) {
        let elements = std::mem::take(&mut self.elements);
        for (_, mut proxy) in elements {
            self.coordinator.dispose(&mut proxy);
        }
        debug!("document torn down");
    }

    /// Apply realm replies and definitions that have already arrived, without
    /// waiting. Returns the number of realm replies applied.
    pub fn pump(&mut self) -> usize {
        self.adopt_definitions();
        let mut applied = 0;
        while let Some(event) = self.coordinator.try_next_event() {
            self.coordinator.handle_event(event, &mut self.elements);
            applied += 1;
        }
        self.coordinator.run_queue(&mut self.elements);
        applied
    }

    /// One scheduling tick: pump, deliver attribute batches, then close grace
    /// windows that have elapsed. Returns the tick number.
    pub fn tick(&mut self) -> u64 {
        self.pump();
        let tick = self.coordinator.flush_attributes(&mut self.elements);
        self.coordinator.expire(&mut self.elements, Instant::now());
        tick
    }

    /// Wait until no instance is waiting on a realm reply. A realm that never
    /// answers stalls this call.
    pub async fn settle(&mut self) {
        loop {
            self.pump();
            if !self.coordinator.awaiting_replies() {
                return;
            }
            let Some(event) = self.coordinator.next_event().await else {
                return;
            };
            self.coordinator.handle_event(event, &mut self.elements);
        }
    }

    fn adopt_definitions(&mut self) {
        let mut changed = false;
        loop {
            match self.definitions.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => changed = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if changed {
            self.upgrade_defined();
        }
    }

    fn upgrade_defined(&mut self) {
        let mut candidates: Vec<_> = self
            .elements
            .values()
            .filter(|proxy| proxy.connected && proxy.state == UpgradeState::Unresolved)
            .filter(|proxy| !self.coordinator.is_pending(proxy.id))
            .map(|proxy| (proxy.connection_order, proxy.id))
            .collect();
        candidates.sort();

        for (_, id) in candidates {
            let Some(proxy) = self.elements.get_mut(&id) else {
                continue;
            };
            if let Some(definition) = self.registry.lookup(&proxy.tag_name) {
                self.coordinator.enqueue(proxy, definition);
            }
        }
        self.coordinator.run_queue(&mut self.elements);
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn validate_attribute_name(name: &str) -> Result<(), DocumentError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| {
            !c.is_whitespace() && !c.is_control() && !matches!(c, '"' | '\'' | '>' | '/' | '=')
        });
    if valid {
        Ok(())
    } else {
        Err(DocumentError::InvalidAttributeName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_names_are_validated() {
        assert!(validate_attribute_name("src").is_ok());
        assert!(validate_attribute_name("data-x").is_ok());
        for name in ["", "a b", "a=b", "x\"", "a/b"] {
            assert_eq!(
                validate_attribute_name(name),
                Err(DocumentError::InvalidAttributeName(name.to_string()))
            );
        }
    }
}
