use std::fmt;

use parking_lot::Mutex;
use url::Url;

use crate::channel::MessageKind;
use crate::host::ElementId;
use crate::realm::{Hook, RealmId};

/// Something that went wrong without failing the operation that hit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    ModuleLoadFailed {
        url: Url,
        reason: String,
    },
    ChannelClosed {
        element: ElementId,
        kind: MessageKind,
    },
    CallbackFailed {
        element: ElementId,
        tag_name: String,
        hook: Hook,
        message: String,
    },
    ConstructFailed {
        element: ElementId,
        tag_name: String,
        reason: String,
    },
    RealmUnavailable {
        element: ElementId,
        reason: String,
    },
    RealmStopped {
        realm: RealmId,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModuleLoadFailed { url, reason } => {
                write!(f, "module {url} failed to load: {reason}")
            }
            Self::ChannelClosed { element, kind } => {
                write!(f, "dropped {kind} for {element}: channel closed")
            }
            Self::CallbackFailed {
                element,
                tag_name,
                hook,
                message,
            } => write!(f, "<{tag_name}> {element} {hook} threw: {message}"),
            Self::ConstructFailed {
                element,
                tag_name,
                reason,
            } => write!(f, "<{tag_name}> {element} failed to construct: {reason}"),
            Self::RealmUnavailable { element, reason } => {
                write!(f, "no realm available for {element}: {reason}")
            }
            Self::RealmStopped { realm } => write!(f, "{realm} stopped unexpectedly"),
        }
    }
}

/// External sink that receives every [`Diagnostic`].
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::ChannelClosed { .. } => {
                tracing::debug!("{diagnostic}");
            }
            Diagnostic::CallbackFailed { .. } | Diagnostic::RealmUnavailable { .. } => {
                tracing::warn!("{diagnostic}");
            }
            _ => {
                tracing::error!("{diagnostic}");
            }
        }
    }
}

/// Keeps every diagnostic in memory, and logs it like [`TracingSink`].
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl DiagnosticsSink for RecordingSink {
    fn report(&self, diagnostic: Diagnostic) {
        TracingSink.report(diagnostic.clone());
        self.entries.lock().push(diagnostic);
    }
}
