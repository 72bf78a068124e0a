use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;

use crate::channel::{ChannelClosedError, ChannelId, ChannelMessage, ChannelSender};
use crate::host::ElementId;

bitflags! {
    /// Lifecycle hooks a class actually implements. Only these are dispatched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const ATTRIBUTE_CHANGED = 1 << 0;
        const CONNECTED = 1 << 1;
        const DISCONNECTED = 1 << 2;
        const MESSAGE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    AttributeChanged,
    Connected,
    Disconnected,
    Message,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AttributeChanged => "attributeChangedCallback",
            Self::Connected => "connectedCallback",
            Self::Disconnected => "disconnectedCallback",
            Self::Message => "message handler",
        })
    }
}

/// Failure raised by realm-side element code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("{0}")]
    Thrown(String),
    #[error("panicked: {0}")]
    Panicked(String),
}

impl CallbackError {
    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown(message.into())
    }
}

/// Realm-side behaviour of a custom element.
///
/// Every hook has a no-op default; which of them run is decided by the
/// class's [`Capabilities`], not by whether a hook was overridden.
pub trait ElementBehavior: Send + 'static {
    fn attribute_changed(
        &mut self,
        _scope: &mut ElementScope<'_>,
        _name: &str,
        _old_value: Option<&str>,
        _new_value: Option<&str>,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    fn connected(&mut self, _scope: &mut ElementScope<'_>) -> Result<(), CallbackError> {
        Ok(())
    }

    fn disconnected(&mut self, _scope: &mut ElementScope<'_>) -> Result<(), CallbackError> {
        Ok(())
    }

    fn message(
        &mut self,
        _scope: &mut ElementScope<'_>,
        _payload: &Value,
    ) -> Result<(), CallbackError> {
        Ok(())
    }
}

type Constructor = Arc<dyn Fn() -> Box<dyn ElementBehavior> + Send + Sync>;

/// A class declared by a worklet module: the `classRef` handed to a realm's
/// `define(tagName, classRef)`.
#[derive(Clone)]
pub struct ElementClass {
    tag_name: String,
    observed_attributes: Vec<String>,
    capabilities: Capabilities,
    constructor: Constructor,
}

impl ElementClass {
    pub fn new<F, B>(tag_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: ElementBehavior,
    {
        Self {
            tag_name: tag_name.into(),
            observed_attributes: Vec::new(),
            capabilities: Capabilities::all(),
            constructor: Arc::new(move || Box::new(constructor()) as Box<dyn ElementBehavior>),
        }
    }

    /// Declare `observedAttributeNames`. Duplicates keep their first position.
    pub fn observe<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.observed_attributes.contains(&name) {
                self.observed_attributes.push(name);
            }
        }
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn observed_attributes(&self) -> &[String] {
        &self.observed_attributes
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub(crate) fn construct(&self) -> Box<dyn ElementBehavior> {
        (self.constructor)()
    }
}

impl fmt::Debug for ElementClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementClass")
            .field("tag_name", &self.tag_name)
            .field("observed_attributes", &self.observed_attributes)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Realm-wide state, visible to every instance hosted by the same realm.
#[derive(Debug, Default)]
pub struct RealmGlobals {
    values: HashMap<String, Value>,
}

impl RealmGlobals {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }
}

/// Realm-side endpoint of an instance's channel.
#[derive(Debug, Clone)]
pub struct RealmPort {
    sender: ChannelSender,
}

impl RealmPort {
    pub(crate) fn new(sender: ChannelSender) -> Self {
        Self { sender }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.sender.id()
    }

    pub fn post_message(&self, payload: Value) -> Result<(), ChannelClosedError> {
        self.sender.send(ChannelMessage::UserMessage { payload })
    }
}

/// What a hook can see while it runs. Parents and ancestors in the host tree
/// are never exposed.
pub struct ElementScope<'a> {
    pub(crate) element: ElementId,
    pub(crate) tag_name: &'a str,
    pub(crate) attributes: &'a IndexMap<String, String>,
    pub(crate) port: &'a RealmPort,
    pub(crate) globals: &'a mut RealmGlobals,
}

impl ElementScope<'_> {
    pub fn element_id(&self) -> ElementId {
        self.element
    }

    pub fn tag_name(&self) -> &str {
        self.tag_name
    }

    /// Mirror of the observed attributes delivered so far.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn port(&self) -> &RealmPort {
        self.port
    }

    pub fn globals(&mut self) -> &mut RealmGlobals {
        self.globals
    }
}
