#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use url::Url;

use worklet_elements::{
    CallbackError, ChannelId, Document, ElementBehavior, ElementClass, ElementId, ElementScope,
    EngineConfig, RealmPool, RecordingSink, Registry, StaticModuleLoader,
};

/// One hook invocation seen by a realm-side instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Attr {
        name: String,
        old: Option<String>,
        new: Option<String>,
    },
    Connected,
    Disconnected,
    Message(Value),
}

pub fn attr(name: &str, old: Option<&str>, new: Option<&str>) -> Call {
    Call::Attr {
        name: name.to_string(),
        old: old.map(str::to_string),
        new: new.map(str::to_string),
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    /// Construction serial of the realm-side instance.
    pub instance: usize,
    pub element: ElementId,
    pub channel: ChannelId,
    pub call: Call,
}

/// Shared log written by every [`Recorder`] built from the same journal.
#[derive(Clone, Default)]
pub struct Journal {
    records: Arc<Mutex<Vec<Record>>>,
    constructed: Arc<AtomicUsize>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(&self, tag_name: &str, observed: &[&str]) -> ElementClass {
        let journal = self.clone();
        ElementClass::new(tag_name, move || Recorder {
            serial: journal.constructed.fetch_add(1, Ordering::SeqCst),
            journal: journal.clone(),
        })
        .observe(observed.iter().copied())
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn calls_for(&self, element: ElementId) -> Vec<Call> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.element == element)
            .map(|record| record.call.clone())
            .collect()
    }

    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    fn push(&self, serial: usize, scope: &ElementScope<'_>, call: Call) {
        self.records.lock().push(Record {
            instance: serial,
            element: scope.element_id(),
            channel: scope.port().channel_id(),
            call,
        });
    }
}

/// Realm-side element that journals every hook.
///
/// Attribute values `"throw"` and `"panic"` make the hook fail. Messages
/// `{"echo": v}` are answered with `v`; `{"count": true}` bumps the realm
/// global `count` and answers with its new value.
pub struct Recorder {
    serial: usize,
    journal: Journal,
}

impl ElementBehavior for Recorder {
    fn attribute_changed(
        &mut self,
        scope: &mut ElementScope<'_>,
        name: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Result<(), CallbackError> {
        self.journal.push(self.serial, scope, attr(name, old_value, new_value));
        match new_value {
            Some("throw") => Err(CallbackError::thrown(format!("bad {name}"))),
            Some("panic") => panic!("{name} exploded"),
            _ => Ok(()),
        }
    }

    fn connected(&mut self, scope: &mut ElementScope<'_>) -> Result<(), CallbackError> {
        self.journal.push(self.serial, scope, Call::Connected);
        Ok(())
    }

    fn disconnected(&mut self, scope: &mut ElementScope<'_>) -> Result<(), CallbackError> {
        self.journal.push(self.serial, scope, Call::Disconnected);
        Ok(())
    }

    fn message(&mut self, scope: &mut ElementScope<'_>, payload: &Value) -> Result<(), CallbackError> {
        self.journal.push(self.serial, scope, Call::Message(payload.clone()));
        if let Some(echo) = payload.get("echo") {
            scope
                .port()
                .post_message(echo.clone())
                .map_err(|err| CallbackError::thrown(err.to_string()))?;
        }
        if payload.get("count").is_some() {
            let count = scope
                .globals()
                .get("count")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                + 1;
            scope.globals().set("count", json!(count));
            scope
                .port()
                .post_message(json!(count))
                .map_err(|err| CallbackError::thrown(err.to_string()))?;
        }
        Ok(())
    }
}

pub fn module_url(name: &str) -> Url {
    Url::parse(&format!("https://modules.worklet.test/{name}.js")).expect("module url")
}

pub struct Harness {
    pub diagnostics: Arc<RecordingSink>,
    pub loader: Arc<StaticModuleLoader>,
    pub registry: Arc<Registry>,
    pub pool: RealmPool,
    pub document: Document,
}

pub fn harness(config: EngineConfig) -> Harness {
    let diagnostics = Arc::new(RecordingSink::new());
    let loader = Arc::new(StaticModuleLoader::new());
    let registry = Arc::new(Registry::new(loader.clone(), diagnostics.clone()));
    let pool = RealmPool::new(Arc::clone(&registry), &config);
    let document = Document::new(pool.clone(), &config);
    Harness {
        diagnostics,
        loader,
        registry,
        pool,
        document,
    }
}
