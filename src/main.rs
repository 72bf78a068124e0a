use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use worklet_elements::{
    CallbackError, Document, ElementBehavior, ElementClass, ElementScope, EngineConfig,
    LightNode, RealmPool, Registry, StaticModuleLoader, TracingSink, WorkletModule,
};

const LAZY_IMAGE_MODULE: &str = "https://demo.worklet.test/lazy-image.js";

/// Realm-side `<lazy-image>`: pretends to load whatever `src` points at and
/// reports back over its port.
#[derive(Default)]
struct LazyImage {
    loaded: Option<String>,
}

impl ElementBehavior for LazyImage {
    fn attribute_changed(
        &mut self,
        scope: &mut ElementScope<'_>,
        name: &str,
        _old_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Result<(), CallbackError> {
        if name != "src" {
            return Ok(());
        }
        self.loaded = new_value.map(str::to_string);
        scope
            .port()
            .post_message(json!({ "loaded": self.loaded }))
            .map_err(|err| CallbackError::thrown(err.to_string()))
    }

    fn connected(&mut self, scope: &mut ElementScope<'_>) -> Result<(), CallbackError> {
        let live = scope
            .globals()
            .get("live")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        scope.globals().set("live", json!(live));
        info!(element = %scope.element_id(), live, "lazy-image connected");
        Ok(())
    }

    fn disconnected(&mut self, scope: &mut ElementScope<'_>) -> Result<(), CallbackError> {
        let live = scope
            .globals()
            .get("live")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .saturating_sub(1);
        scope.globals().set("live", json!(live));
        Ok(())
    }
}

fn main() -> Result<()> {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WORKLET_CONFIG").ok())
        .map(PathBuf::from);
    let config = EngineConfig::load(config_path).context("failed to load engine config")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run(config))
}

async fn run(config: EngineConfig) -> Result<()> {
    let url = Url::parse(LAZY_IMAGE_MODULE)?;
    let loader = StaticModuleLoader::new();
    loader.insert(
        WorkletModule::new(url.clone())
            .define(ElementClass::new("lazy-image", LazyImage::default).observe(["src", "alt"])),
    );

    let registry = Arc::new(Registry::new(Arc::new(loader), Arc::new(TracingSink)));
    let pool = RealmPool::new(Arc::clone(&registry), &config);
    let mut document = Document::new(pool.clone(), &config);

    // Parsed before the module is registered: stays unresolved until then.
    let early = document
        .create_element_with("lazy-image", [("src", "cat.jpeg"), ("alt", "a cat")])
        .context("invalid attributes")?;
    document.append_child(early, LightNode::Text("loading…".to_string()))?;
    document.connect(early)?;
    info!(element = %early, state = ?document.state(early)?, "before registration");

    document
        .register_module(&url)
        .await
        .with_context(|| format!("failed to register {url}"))?;
    document.settle().await;
    info!(element = %early, state = ?document.state(early)?, "after registration");
    print_messages(&mut document, early)?;

    // Attribute churn inside one tick reaches the realm as one batch.
    document.set_attribute(early, "src", "dog.png")?;
    document.set_attribute(early, "src", "fox.png")?;
    document.tick();
    document.settle().await;
    print_messages(&mut document, early)?;

    // Moving the element within the grace window keeps its instance.
    document.disconnect(early)?;
    document.tick();
    document.connect(early)?;
    document.settle().await;
    info!(
        element = %early,
        state = ?document.state(early)?,
        realms = pool.live_realms(),
        "re-inserted within grace window"
    );

    // Leaving it out longer than the window disposes the instance.
    document.disconnect(early)?;
    tokio::time::sleep(config.grace_window() + Duration::from_millis(10)).await;
    document.tick();
    info!(
        element = %early,
        state = ?document.state(early)?,
        realms = pool.live_realms(),
        "grace window elapsed"
    );

    document.teardown();
    pool.shutdown();
    Ok(())
}

fn print_messages(document: &mut Document, element: worklet_elements::ElementId) -> Result<()> {
    if let Some(port) = document.port_mut(element)? {
        while let Some(payload) = port.try_recv() {
            info!(%element, %payload, "message from realm");
        }
    }
    Ok(())
}
