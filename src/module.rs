//! Worklet modules and the loader that fetches and evaluates them.
//!
//! Fetching and evaluating module code happens outside this crate; a
//! [`ModuleLoader`] hands back the element classes a module declares.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use thiserror::Error;
use url::Url;

use crate::realm::ElementClass;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to load worklet module {url}: {reason}")]
pub struct ModuleLoadError {
    pub url: Url,
    pub reason: String,
}

impl ModuleLoadError {
    pub fn new(url: &Url, reason: impl Into<String>) -> Self {
        Self {
            url: url.clone(),
            reason: reason.into(),
        }
    }
}

/// An evaluated worklet module: the element classes it declares, in
/// declaration order.
#[derive(Debug, Clone)]
pub struct WorkletModule {
    url: Url,
    classes: Vec<ElementClass>,
}

impl WorkletModule {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            classes: Vec::new(),
        }
    }

    pub fn define(mut self, class: ElementClass) -> Self {
        self.classes.push(class);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn into_classes(self) -> Vec<ElementClass> {
        self.classes
    }
}

pub trait ModuleLoader: Send + Sync {
    fn load<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<WorkletModule, ModuleLoadError>>;
}

enum Entry {
    Module(WorkletModule),
    Broken(String),
}

/// Loader backed by modules registered in memory.
#[derive(Default)]
pub struct StaticModuleLoader {
    entries: RwLock<HashMap<Url, Entry>>,
    fetches: AtomicUsize,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, module: WorkletModule) {
        self.entries
            .write()
            .insert(module.url().clone(), Entry::Module(module));
    }

    /// Make `url` fail to evaluate with `reason`.
    pub fn insert_broken(&self, url: Url, reason: impl Into<String>) {
        self.entries.write().insert(url, Entry::Broken(reason.into()));
    }

    /// How many times [`ModuleLoader::load`] was called.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<WorkletModule, ModuleLoadError>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let result = match self.entries.read().get(url) {
            Some(Entry::Module(module)) => Ok(module.clone()),
            Some(Entry::Broken(reason)) => Err(ModuleLoadError::new(url, reason.clone())),
            None => Err(ModuleLoadError::new(url, "module not found")),
        };
        future::ready(result).boxed()
    }
}
