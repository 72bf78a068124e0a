//! Process-wide tag name → element definition registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;
use url::Url;

use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::module::{ModuleLoadError, ModuleLoader};
use crate::realm::{Capabilities, ElementClass};

const DEFINITION_EVENTS_CAPACITY: usize = 64;

const RESERVED_TAG_NAMES: &[&str] = &[
    "annotation-xml",
    "color-profile",
    "font-face",
    "font-face-src",
    "font-face-uri",
    "font-face-format",
    "font-face-name",
    "missing-glyph",
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("<{0}> is already defined")]
    DuplicateTag(String),
    #[error("{0:?} is not a valid custom element name")]
    InvalidTagName(String),
    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),
}

/// Immutable record of a registered tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDefinition {
    tag_name: String,
    module_url: Url,
    observed_attribute_names: Vec<String>,
    capabilities: Capabilities,
}

impl ElementDefinition {
    fn from_class(module_url: &Url, class: &ElementClass) -> Self {
        Self {
            tag_name: class.tag_name().to_string(),
            module_url: module_url.clone(),
            observed_attribute_names: class.observed_attributes().to_vec(),
            capabilities: class.capabilities(),
        }
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn module_url(&self) -> &Url {
        &self.module_url
    }

    /// `observedAttributeNames`, in declaration order.
    pub fn observed_attribute_names(&self) -> &[String] {
        &self.observed_attribute_names
    }

    pub fn observes(&self, name: &str) -> bool {
        self.observed_attribute_names.iter().any(|observed| observed == name)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

#[derive(Default)]
struct RegistryState {
    definitions: HashMap<String, Arc<ElementDefinition>>,
    modules: HashMap<Url, Vec<ElementClass>>,
}

/// Write-once-per-tag registry. All writes go through one lock, so of two
/// registrations racing for the same tag exactly one succeeds.
pub struct Registry {
    loader: Arc<dyn ModuleLoader>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    state: RwLock<RegistryState>,
    defined: broadcast::Sender<Arc<ElementDefinition>>,
}

impl Registry {
    pub fn new(loader: Arc<dyn ModuleLoader>, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        let (defined, _) = broadcast::channel(DEFINITION_EVENTS_CAPACITY);
        Self {
            loader,
            diagnostics,
            state: RwLock::new(RegistryState::default()),
            defined,
        }
    }

    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticsSink> {
        &self.diagnostics
    }

    /// Load the module at `url` and define every tag it declares.
    ///
    /// Registration is all-or-nothing: if any declared tag is invalid or
    /// already defined, none of the module's tags are recorded.
    pub async fn register_module(
        &self,
        url: &Url,
    ) -> Result<Vec<Arc<ElementDefinition>>, RegistryError> {
        let module = match self.loader.load(url).await {
            Ok(module) => module,
            Err(error) => {
                self.diagnostics.report(Diagnostic::ModuleLoadFailed {
                    url: url.clone(),
                    reason: error.reason.clone(),
                });
                return Err(error.into());
            }
        };
        let classes = module.into_classes();
        for class in &classes {
            validate_tag_name(class.tag_name())?;
        }

        let definitions = {
            let mut state = self.state.write();
            {
                let mut seen = HashSet::new();
                for class in &classes {
                    let tag_name = class.tag_name();
                    if state.definitions.contains_key(tag_name) || !seen.insert(tag_name) {
                        return Err(RegistryError::DuplicateTag(tag_name.to_string()));
                    }
                }
            }

            let definitions: Vec<_> = classes
                .iter()
                .map(|class| Arc::new(ElementDefinition::from_class(url, class)))
                .collect();
            for definition in &definitions {
                state
                    .definitions
                    .insert(definition.tag_name.clone(), Arc::clone(definition));
            }
            state
                .modules
                .entry(url.clone())
                .or_default()
                .extend(classes);
            definitions
        };

        for definition in &definitions {
            // No subscribers is fine.
            let _ = self.defined.send(Arc::clone(definition));
        }
        info!(
            module = %url,
            tags = ?definitions.iter().map(|d| d.tag_name()).collect::<Vec<_>>(),
            "module registered"
        );
        Ok(definitions)
    }

    pub fn lookup(&self, tag_name: &str) -> Option<Arc<ElementDefinition>> {
        self.state.read().definitions.get(tag_name).cloned()
    }

    pub fn is_defined(&self, tag_name: &str) -> bool {
        self.state.read().definitions.contains_key(tag_name)
    }

    /// Definitions declared by the module at `url`, in declaration order.
    pub fn definitions_for(&self, url: &Url) -> Vec<Arc<ElementDefinition>> {
        let state = self.state.read();
        state
            .modules
            .get(url)
            .into_iter()
            .flatten()
            .filter_map(|class| state.definitions.get(class.tag_name()).cloned())
            .collect()
    }

    pub(crate) fn classes_for(&self, url: &Url) -> Option<Vec<ElementClass>> {
        self.state.read().modules.get(url).cloned()
    }

    /// Stream of definitions as they are registered.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ElementDefinition>> {
        self.defined.subscribe()
    }

    /// Resolves once `tag_name` is defined.
    pub async fn when_defined(&self, tag_name: &str) -> Arc<ElementDefinition> {
        let mut events = self.defined.subscribe();
        if let Some(definition) = self.lookup(tag_name) {
            return definition;
        }
        loop {
            match events.recv().await {
                Ok(definition) if definition.tag_name() == tag_name => return definition,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if let Some(definition) = self.lookup(tag_name) {
                        return definition;
                    }
                }
                // `self` owns the sender, so this never happens while we are borrowed.
                Err(RecvError::Closed) => future::pending::<()>().await,
            }
        }
    }
}

pub fn validate_tag_name(tag_name: &str) -> Result<(), RegistryError> {
    let valid = tag_name.starts_with(|c: char| c.is_ascii_lowercase())
        && tag_name.contains('-')
        && !RESERVED_TAG_NAMES.contains(&tag_name)
        && tag_name.chars().all(|c| {
            c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || matches!(c, '-' | '.' | '_')
                || (!c.is_ascii() && !c.is_whitespace())
        });
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTagName(tag_name.to_string()))
    }
}
