//! Cross-realm custom elements: element logic runs in isolated worklet realms
//! while a host-side proxy stays in the document and mirrors attributes and
//! lifecycle over a per-instance channel.

pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod host;
pub mod module;
pub mod realm;
pub mod registry;
pub mod sync;
pub mod upgrade;

pub use channel::{AttributeChange, ChannelClosedError, ChannelId, ChannelMessage, MessageKind};
pub use config::{ConfigError, EngineConfig};
pub use diagnostics::{Diagnostic, DiagnosticsSink, RecordingSink, TracingSink};
pub use host::{Document, DocumentError, ElementId, HostPort, HostProxy, LightNode, UpgradeState};
pub use module::{ModuleLoadError, ModuleLoader, StaticModuleLoader, WorkletModule};
pub use realm::{
    CallbackError, Capabilities, ElementBehavior, ElementClass, ElementScope, Hook, PoolError,
    PoolingPolicy, RealmGlobals, RealmId, RealmPool, RealmPort,
};
pub use registry::{ElementDefinition, Registry, RegistryError};
pub use sync::{AttributeMap, AttributeSyncEngine, DisconnectedAttributePolicy};
pub use upgrade::UpgradeCoordinator;
