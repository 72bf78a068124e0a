use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use url::Url;

use super::{Realm, RealmHandle, RealmId};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, DiagnosticsSink};
use crate::registry::{ElementDefinition, Registry};

/// How realms are shared between the instances of one module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingPolicy {
    /// One realm per module, reused by all of its instances.
    #[default]
    Shared,
    /// One realm per instance.
    Dedicated,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("module {0} is not registered")]
    UnknownModule(Url),
    #[error("realm limit of {limit} reached")]
    Exhausted { limit: usize },
    #[error("no tokio runtime available to host realms")]
    NoRuntime,
}

struct PooledRealm {
    realm: Realm,
    refs: usize,
}

#[derive(Default)]
struct PoolState {
    next_id: u64,
    realms: HashMap<RealmId, PooledRealm>,
    shared: HashMap<Url, RealmId>,
}

/// Arena of realms keyed by module, with explicit acquire/release.
///
/// Every acquired reference must be handed back through [`RealmPool::release`];
/// a realm is shut down when its count returns to zero.
#[derive(Clone)]
pub struct RealmPool {
    registry: Arc<Registry>,
    policy: PoolingPolicy,
    max_realms: Option<usize>,
    state: Arc<Mutex<PoolState>>,
}

impl RealmPool {
    pub fn new(registry: Arc<Registry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            policy: config.pooling,
            max_realms: config.max_realms,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn policy(&self) -> PoolingPolicy {
        self.policy
    }

    fn diagnostics(&self) -> &Arc<dyn DiagnosticsSink> {
        self.registry.diagnostics()
    }

    /// Hand out a realm for `definition`, creating one when the policy asks for
    /// it. The returned reference is counted until [`RealmPool::release`].
    pub fn acquire(&self, definition: &ElementDefinition) -> Result<RealmHandle, PoolError> {
        let module = definition.module_url();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if self.policy == PoolingPolicy::Shared {
            if let Some(id) = state.shared.get(module).copied() {
                if let Some(pooled) = state
                    .realms
                    .get_mut(&id)
                    .filter(|pooled| pooled.realm.handle().is_running())
                {
                    pooled.refs += 1;
                    return Ok(pooled.realm.handle().clone());
                }

                // The realm task ended on its own; forget it and start over.
                state.shared.remove(module);
                if let Some(pooled) = state.realms.remove(&id) {
                    pooled.realm.shutdown();
                }
                self.diagnostics()
                    .report(Diagnostic::RealmStopped { realm: id });
            }
        }

        if let Some(limit) = self.max_realms {
            if state.realms.len() >= limit {
                return Err(PoolError::Exhausted { limit });
            }
        }

        let classes = self
            .registry
            .classes_for(module)
            .ok_or_else(|| PoolError::UnknownModule(module.clone()))?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        state.next_id += 1;
        let id = RealmId(state.next_id);
        let realm = Realm::spawn(
            &runtime,
            id,
            module.clone(),
            &classes,
            Arc::clone(self.diagnostics()),
        );
        let handle = realm.handle().clone();
        state.realms.insert(id, PooledRealm { realm, refs: 1 });
        if self.policy == PoolingPolicy::Shared {
            state.shared.insert(module.clone(), id);
        }

        tracing::debug!(
            realm = %id,
            module = %module,
            policy = ?self.policy,
            "created realm"
        );
        Ok(handle)
    }

    /// Drop one reference to `realm`.
    pub fn release(&self, realm: RealmId) {
        let mut state = self.state.lock();
        let Some(pooled) = state.realms.get_mut(&realm) else {
            return;
        };
        pooled.refs = pooled.refs.saturating_sub(1);
        if pooled.refs > 0 {
            return;
        }

        if let Some(pooled) = state.realms.remove(&realm) {
            let module = pooled.realm.handle().module().clone();
            if state.shared.get(&module) == Some(&realm) {
                state.shared.remove(&module);
            }
            pooled.realm.shutdown();
            tracing::debug!(%realm, %module, "destroyed idle realm");
        }
    }

    pub fn live_realms(&self) -> usize {
        self.state.lock().realms.len()
    }

    pub fn ref_count(&self, realm: RealmId) -> usize {
        self.state
            .lock()
            .realms
            .get(&realm)
            .map_or(0, |pooled| pooled.refs)
    }

    /// Stop every realm regardless of outstanding references.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shared.clear();
        for (_, pooled) in state.realms.drain() {
            pooled.realm.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::RecordingSink;
    use crate::module::{StaticModuleLoader, WorkletModule};
    use crate::realm::{ElementBehavior, ElementClass};

    struct Inert;

    impl ElementBehavior for Inert {}

    async fn registry_with(urls: &[&str]) -> Arc<Registry> {
        let loader = StaticModuleLoader::new();
        for (index, url) in urls.iter().enumerate() {
            let url = Url::parse(url).unwrap();
            loader.insert(
                WorkletModule::new(url)
                    .define(ElementClass::new(format!("x-el-{index}"), || Inert))
                    .define(ElementClass::new(format!("x-alt-{index}"), || Inert)),
            );
        }
        let registry = Arc::new(Registry::new(
            Arc::new(loader),
            Arc::new(RecordingSink::new()),
        ));
        for url in urls {
            registry
                .register_module(&Url::parse(url).unwrap())
                .await
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn shared_policy_reuses_one_realm_per_module() {
        let registry = registry_with(&["https://example.test/a.js"]).await;
        let pool = RealmPool::new(Arc::clone(&registry), &EngineConfig::default());

        let first = registry.lookup("x-el-0").unwrap();
        let second = registry.lookup("x-alt-0").unwrap();
        let a = pool.acquire(&first).unwrap();
        let b = pool.acquire(&second).unwrap();

        assert_eq!(a.id(), b.id());
        assert_eq!(pool.live_realms(), 1);
        assert_eq!(pool.ref_count(a.id()), 2);

        pool.release(a.id());
        assert_eq!(pool.ref_count(a.id()), 1);
        pool.release(b.id());
        assert_eq!(pool.live_realms(), 0);
    }

    #[tokio::test]
    async fn dedicated_policy_creates_a_realm_per_acquire() {
        let registry = registry_with(&["https://example.test/a.js"]).await;
        let config = EngineConfig {
            pooling: PoolingPolicy::Dedicated,
            ..EngineConfig::default()
        };
        let pool = RealmPool::new(Arc::clone(&registry), &config);
        let definition = registry.lookup("x-el-0").unwrap();

        let a = pool.acquire(&definition).unwrap();
        let b = pool.acquire(&definition).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.live_realms(), 2);

        pool.release(a.id());
        assert_eq!(pool.live_realms(), 1);
        assert_eq!(pool.ref_count(b.id()), 1);
    }

    #[tokio::test]
    async fn max_realms_bounds_live_realms() {
        let registry =
            registry_with(&["https://example.test/a.js", "https://example.test/b.js"]).await;
        let config = EngineConfig {
            max_realms: Some(1),
            ..EngineConfig::default()
        };
        let pool = RealmPool::new(Arc::clone(&registry), &config);

        let a = pool.acquire(&registry.lookup("x-el-0").unwrap()).unwrap();
        let err = pool
            .acquire(&registry.lookup("x-el-1").unwrap())
            .unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { limit: 1 }));

        // The shared realm is still handed out past the limit.
        assert!(pool.acquire(&registry.lookup("x-alt-0").unwrap()).is_ok());

        pool.release(a.id());
        pool.release(a.id());
        assert!(pool.acquire(&registry.lookup("x-el-1").unwrap()).is_ok());
    }
}
