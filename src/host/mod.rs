//! Host realm: the document and the proxies it hands out for custom elements.

mod document;
mod proxy;

pub use document::{Document, DocumentError};
pub use proxy::{ElementId, HostPort, HostProxy, LightNode, UpgradeState};
