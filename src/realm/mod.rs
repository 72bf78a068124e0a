//! Worklet realms: isolated execution contexts that host realm-side element
//! instances and talk to the host only through channels.

mod element;
pub mod pool;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::stream::{BoxStream, SelectAll, StreamExt};
use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::channel::{AttributeChange, ChannelEndpoint, ChannelId, ChannelMessage, MessageKind};
use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::host::ElementId;

pub use element::{
    CallbackError, Capabilities, ElementBehavior, ElementClass, ElementScope, Hook, RealmGlobals,
    RealmPort,
};
pub use pool::{PoolError, PoolingPolicy, RealmPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealmId(u64);

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "realm#{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) enum RealmCommand {
    Define(ElementClass),
    Construct {
        element: ElementId,
        tag_name: String,
        endpoint: ChannelEndpoint,
        replies: mpsc::UnboundedSender<RealmEvent>,
    },
    Release {
        element: ElementId,
        channel: ChannelId,
    },
    Shutdown,
}

/// Replies a realm sends back to the upgrade coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RealmEvent {
    Constructed {
        element: ElementId,
        channel: ChannelId,
    },
    ConstructFailed {
        element: ElementId,
        channel: ChannelId,
        reason: String,
    },
    /// A channel message was taken off the queue and its hooks have run.
    Delivered {
        element: ElementId,
        channel: ChannelId,
        kind: MessageKind,
    },
}

/// Cheap handle used by the host side to drive a realm.
#[derive(Debug, Clone)]
pub struct RealmHandle {
    id: RealmId,
    module: Url,
    commands: mpsc::UnboundedSender<RealmCommand>,
}

impl RealmHandle {
    pub fn id(&self) -> RealmId {
        self.id
    }

    pub fn module(&self) -> &Url {
        &self.module
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: RealmCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub(crate) fn construct(
        &self,
        element: ElementId,
        tag_name: &str,
        endpoint: ChannelEndpoint,
        replies: mpsc::UnboundedSender<RealmEvent>,
    ) -> bool {
        self.send(RealmCommand::Construct {
            element,
            tag_name: tag_name.to_string(),
            endpoint,
            replies,
        })
    }

    pub(crate) fn release(&self, element: ElementId, channel: ChannelId) {
        self.send(RealmCommand::Release { element, channel });
    }
}

/// A running realm. Owned by the [`RealmPool`].
pub(crate) struct Realm {
    handle: RealmHandle,
    task: JoinHandle<()>,
}

impl Realm {
    pub(crate) fn spawn(
        runtime: &Handle,
        id: RealmId,
        module: Url,
        classes: &[ElementClass],
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let handle = RealmHandle {
            id,
            module: module.clone(),
            commands,
        };
        for class in classes {
            handle.send(RealmCommand::Define(class.clone()));
        }

        let state = RealmState {
            id,
            classes: HashMap::new(),
            instances: HashMap::new(),
            globals: RealmGlobals::default(),
            diagnostics,
        };
        let task = runtime.spawn(run(state, inbox));
        debug!(realm = %id, module = %module, "realm started");

        Self { handle, task }
    }

    pub(crate) fn handle(&self) -> &RealmHandle {
        &self.handle
    }

    pub(crate) fn shutdown(self) {
        if !self.handle.send(RealmCommand::Shutdown) {
            self.task.abort();
        }
    }
}

type Inbox = BoxStream<'static, (ElementId, ChannelId, ChannelMessage)>;

struct RealmInstance {
    tag_name: String,
    channel: ChannelId,
    capabilities: Capabilities,
    behavior: Box<dyn ElementBehavior>,
    attributes: IndexMap<String, String>,
    port: RealmPort,
    replies: mpsc::UnboundedSender<RealmEvent>,
}

impl RealmInstance {
    fn mirror(&mut self, change: &AttributeChange) {
        match &change.new_value {
            Some(value) => {
                self.attributes.insert(change.name.clone(), value.clone());
            }
            None => {
                self.attributes.shift_remove(&change.name);
            }
        }
    }

    fn invoke<F>(
        &mut self,
        element: ElementId,
        hook: Hook,
        globals: &mut RealmGlobals,
        diagnostics: &dyn DiagnosticsSink,
        callback: F,
    ) where
        F: FnOnce(&mut dyn ElementBehavior, &mut ElementScope<'_>) -> Result<(), CallbackError>,
    {
        let mut scope = ElementScope {
            element,
            tag_name: &self.tag_name,
            attributes: &self.attributes,
            port: &self.port,
            globals,
        };
        let behavior = self.behavior.as_mut();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(behavior, &mut scope)))
            .unwrap_or_else(|payload| Err(CallbackError::Panicked(panic_message(payload.as_ref()))));

        if let Err(error) = outcome {
            diagnostics.report(Diagnostic::CallbackFailed {
                element,
                tag_name: self.tag_name.clone(),
                hook,
                message: error.to_string(),
            });
        }
    }
}

struct RealmState {
    id: RealmId,
    classes: HashMap<String, ElementClass>,
    instances: HashMap<ElementId, RealmInstance>,
    globals: RealmGlobals,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl RealmState {
    fn handle_command(&mut self, command: RealmCommand, inboxes: &mut SelectAll<Inbox>) {
        match command {
            RealmCommand::Define(class) => {
                debug!(realm = %self.id, tag = class.tag_name(), "define");
                self.classes.insert(class.tag_name().to_string(), class);
            }
            RealmCommand::Construct {
                element,
                tag_name,
                endpoint,
                replies,
            } => self.construct(element, tag_name, endpoint, replies, inboxes),
            RealmCommand::Release { element, channel } => {
                if self
                    .instances
                    .get(&element)
                    .is_some_and(|instance| instance.channel == channel)
                {
                    self.instances.remove(&element);
                    debug!(realm = %self.id, %element, "instance released");
                }
            }
            // Handled by the run loop.
            RealmCommand::Shutdown => {}
        }
    }

    fn construct(
        &mut self,
        element: ElementId,
        tag_name: String,
        endpoint: ChannelEndpoint,
        replies: mpsc::UnboundedSender<RealmEvent>,
        inboxes: &mut SelectAll<Inbox>,
    ) {
        let channel = endpoint.id();
        let Some(class) = self.classes.get(&tag_name) else {
            let _ = replies.send(RealmEvent::ConstructFailed {
                element,
                channel,
                reason: format!("<{tag_name}> is not defined in {}", self.id),
            });
            return;
        };

        let behavior = match panic::catch_unwind(AssertUnwindSafe(|| class.construct())) {
            Ok(behavior) => behavior,
            Err(payload) => {
                let _ = replies.send(RealmEvent::ConstructFailed {
                    element,
                    channel,
                    reason: panic_message(payload.as_ref()),
                });
                return;
            }
        };
        let capabilities = class.capabilities();

        let (sender, receiver) = endpoint.split();
        inboxes.push(
            receiver
                .into_stream()
                .map(move |message| (element, channel, message))
                .boxed(),
        );
        self.instances.insert(
            element,
            RealmInstance {
                tag_name,
                channel,
                capabilities,
                behavior,
                attributes: IndexMap::new(),
                port: RealmPort::new(sender),
                replies: replies.clone(),
            },
        );
        debug!(realm = %self.id, %element, %channel, "instance constructed");
        let _ = replies.send(RealmEvent::Constructed { element, channel });
    }

    fn dispatch(&mut self, element: ElementId, channel: ChannelId, message: ChannelMessage) {
        let RealmState {
            instances,
            globals,
            diagnostics,
            ..
        } = self;
        let Some(instance) = instances
            .get_mut(&element)
            .filter(|instance| instance.channel == channel)
        else {
            return;
        };
        let kind = message.kind();
        let capabilities = instance.capabilities;
        let diagnostics = diagnostics.as_ref();

        match message {
            ChannelMessage::AttrBatch { entries } => {
                for change in entries {
                    instance.mirror(&change);
                    if capabilities.contains(Capabilities::ATTRIBUTE_CHANGED) {
                        instance.invoke(
                            element,
                            Hook::AttributeChanged,
                            globals,
                            diagnostics,
                            |behavior, scope| {
                                behavior.attribute_changed(
                                    scope,
                                    &change.name,
                                    change.old_value.as_deref(),
                                    change.new_value.as_deref(),
                                )
                            },
                        );
                    }
                }
            }
            ChannelMessage::Connect => {
                if capabilities.contains(Capabilities::CONNECTED) {
                    instance.invoke(element, Hook::Connected, globals, diagnostics, |behavior, scope| {
                        behavior.connected(scope)
                    });
                }
            }
            ChannelMessage::Disconnect => {
                if capabilities.contains(Capabilities::DISCONNECTED) {
                    instance.invoke(
                        element,
                        Hook::Disconnected,
                        globals,
                        diagnostics,
                        |behavior, scope| behavior.disconnected(scope),
                    );
                }
            }
            ChannelMessage::UserMessage { payload } => {
                if capabilities.contains(Capabilities::MESSAGE) {
                    instance.invoke(element, Hook::Message, globals, diagnostics, |behavior, scope| {
                        behavior.message(scope, &payload)
                    });
                }
            }
        }

        let _ = instance.replies.send(RealmEvent::Delivered {
            element,
            channel,
            kind,
        });
    }
}

async fn run(mut state: RealmState, mut commands: mpsc::UnboundedReceiver<RealmCommand>) {
    let mut inboxes: SelectAll<Inbox> = SelectAll::new();

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(RealmCommand::Shutdown) | None => break,
                Some(command) => state.handle_command(command, &mut inboxes),
            },
            Some((element, channel, message)) = inboxes.next(), if !inboxes.is_empty() => {
                state.dispatch(element, channel, message);
            }
        }
    }

    debug!(
        realm = %state.id,
        instances = state.instances.len(),
        "realm stopped"
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
