mod common;

use common::{attr, harness, module_url, Call, Journal};
use worklet_elements::{
    Diagnostic, ElementClass, ElementBehavior, EngineConfig, Hook, LightNode, UpgradeState,
    WorkletModule,
};

#[tokio::test]
async fn element_parsed_before_registration_upgrades_once_defined() {
    let mut h = harness(EngineConfig::default());
    let journal = Journal::new();
    let url = module_url("lazy-image");
    h.loader.insert(
        WorkletModule::new(url.clone()).define(journal.class("lazy-image", &["src", "alt"])),
    );

    let image = h
        .document
        .create_element_with("lazy-image", [("alt", "a cat"), ("src", "cat.jpeg")])
        .expect("create element");
    h.document
        .append_child(image, LightNode::Text("loading".into()))
        .expect("append child");
    h.document.connect(image).expect("connect");
    h.document.settle().await;

    assert_eq!(h.document.state(image).unwrap(), UpgradeState::Unresolved);
    assert!(!h.document.is_resolved(image).unwrap());
    assert!(h.document.element(image).unwrap().port().is_none());

    h.document
        .register_module(&url)
        .await
        .expect("register module");
    h.document.settle().await;

    assert_eq!(h.document.state(image).unwrap(), UpgradeState::Resolved);
    assert!(h.document.is_resolved(image).unwrap());
    assert_eq!(
        journal.calls_for(image),
        vec![
            attr("src", None, Some("cat.jpeg")),
            attr("alt", None, Some("a cat")),
            Call::Connected,
        ]
    );
    assert_eq!(
        h.document.element(image).unwrap().light_tree(),
        &[LightNode::Text("loading".into())]
    );
    assert!(h.diagnostics.entries().is_empty());
}

#[tokio::test]
async fn element_created_after_registration_waits_for_insertion() {
    let mut h = harness(EngineConfig::default());
    let journal = Journal::new();
    let url = module_url("lazy-image");
    h.loader.insert(
        WorkletModule::new(url.clone()).define(journal.class("lazy-image", &["src", "alt"])),
    );
    h.document
        .register_module(&url)
        .await
        .expect("register module");

    let image = h
        .document
        .create_element_with("lazy-image", [("src", "cat.jpeg")])
        .expect("create element");
    h.document.settle().await;

    assert_eq!(
        h.document.state(image).unwrap(),
        UpgradeState::AttributesDelivered
    );
    assert!(!h.document.is_resolved(image).unwrap());
    assert_eq!(
        journal.calls_for(image),
        vec![attr("src", None, Some("cat.jpeg"))]
    );

    h.document.connect(image).expect("connect");
    h.document.settle().await;

    assert_eq!(h.document.state(image).unwrap(), UpgradeState::Resolved);
    assert_eq!(
        journal.calls_for(image),
        vec![attr("src", None, Some("cat.jpeg")), Call::Connected]
    );
}

#[tokio::test]
async fn connected_never_precedes_initial_attributes() {
    let mut h = harness(EngineConfig::default());
    let journal = Journal::new();
    let url = module_url("widgets");
    h.loader
        .insert(WorkletModule::new(url.clone()).define(journal.class("x-widget", &["size"])));
    h.document
        .register_module(&url)
        .await
        .expect("register module");

    let mut widgets = Vec::new();
    for size in ["1", "2", "3", "4"] {
        let widget = h
            .document
            .create_element_with("x-widget", [("size", size)])
            .expect("create element");
        h.document.connect(widget).expect("connect");
        widgets.push(widget);
    }
    h.document.settle().await;

    for widget in widgets {
        let calls = journal.calls_for(widget);
        assert_eq!(calls.len(), 2, "{calls:?}");
        assert!(matches!(calls[0], Call::Attr { .. }));
        assert_eq!(calls[1], Call::Connected);
    }
}

#[tokio::test]
async fn mutations_before_instantiation_fold_into_initial_batch() {
    let mut h = harness(EngineConfig::default());
    let journal = Journal::new();
    let url = module_url("lazy-image");
    h.loader
        .insert(WorkletModule::new(url.clone()).define(journal.class("lazy-image", &["src"])));
    h.document
        .register_module(&url)
        .await
        .expect("register module");

    let image = h
        .document
        .create_element_with("lazy-image", [("src", "cat.jpeg")])
        .expect("create element");
    h.document.connect(image).expect("connect");
    assert_eq!(h.document.state(image).unwrap(), UpgradeState::PortCreated);

    h.document.set_attribute(image, "src", "dog.png").unwrap();
    h.document.tick();
    h.document.settle().await;

    assert_eq!(
        journal.calls_for(image),
        vec![attr("src", None, Some("dog.png")), Call::Connected]
    );
}

#[tokio::test]
async fn failing_constructor_leaves_element_unresolved() {
    struct Inert;
    impl ElementBehavior for Inert {}

    let mut h = harness(EngineConfig::default());
    let journal = Journal::new();
    let url = module_url("mixed");
    h.loader.insert(
        WorkletModule::new(url.clone())
            .define(ElementClass::new("x-broken", || -> Inert {
                panic!("constructor exploded")
            }))
            .define(journal.class("x-fine", &[])),
    );
    h.document
        .register_module(&url)
        .await
        .expect("register module");

    let broken = h.document.create_element("x-broken");
    let fine = h.document.create_element("x-fine");
    h.document.connect(broken).unwrap();
    h.document.connect(fine).unwrap();
    h.document.settle().await;

    assert_eq!(h.document.state(broken).unwrap(), UpgradeState::Unresolved);
    assert!(h.document.element(broken).unwrap().port().is_none());
    assert_eq!(h.document.state(fine).unwrap(), UpgradeState::Resolved);

    let diagnostics = h.diagnostics.entries();
    assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
    match &diagnostics[0] {
        Diagnostic::ConstructFailed {
            element,
            tag_name,
            reason,
        } => {
            assert_eq!(*element, broken);
            assert_eq!(tag_name, "x-broken");
            assert!(reason.contains("constructor exploded"), "{reason}");
        }
        other => panic!("unexpected diagnostic {other:?}"),
    }

    // A construction failure is final for that element.
    h.document.disconnect(broken).unwrap();
    h.document.connect(broken).unwrap();
    h.document.settle().await;
    assert_eq!(h.document.state(broken).unwrap(), UpgradeState::Unresolved);
}

#[tokio::test]
async fn callback_errors_are_reported_and_do_not_stop_the_instance() {
    let mut h = harness(EngineConfig::default());
    let journal = Journal::new();
    let url = module_url("lazy-image");
    h.loader
        .insert(WorkletModule::new(url.clone()).define(journal.class("lazy-image", &["src"])));
    h.document
        .register_module(&url)
        .await
        .expect("register module");

    let image = h
        .document
        .create_element_with("lazy-image", [("src", "throw")])
        .expect("create element");
    h.document.connect(image).unwrap();
    h.document.settle().await;

    h.document.set_attribute(image, "src", "panic").unwrap();
    h.document.tick();
    h.document.settle().await;

    assert_eq!(h.document.state(image).unwrap(), UpgradeState::Resolved);
    assert_eq!(
        journal.calls_for(image),
        vec![
            attr("src", None, Some("throw")),
            Call::Connected,
            attr("src", Some("throw"), Some("panic")),
        ]
    );

    let failures: Vec<_> = h
        .diagnostics
        .entries()
        .into_iter()
        .filter_map(|diagnostic| match diagnostic {
            Diagnostic::CallbackFailed { hook, message, .. } => Some((hook, message)),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 2, "{failures:?}");
    assert_eq!(failures[0].0, Hook::AttributeChanged);
    assert!(failures[0].1.contains("bad src"));
    assert!(failures[1].1.contains("src exploded"));
}

#[tokio::test]
async fn destroying_an_element_cancels_its_upgrade() {
    let mut h = harness(EngineConfig::default());
    let journal = Journal::new();
    let url = module_url("lazy-image");
    h.loader
        .insert(WorkletModule::new(url.clone()).define(journal.class("lazy-image", &["src"])));
    h.document
        .register_module(&url)
        .await
        .expect("register module");

    let image = h
        .document
        .create_element_with("lazy-image", [("src", "cat.jpeg")])
        .expect("create element");
    h.document.connect(image).unwrap();
    assert_eq!(h.pool.live_realms(), 1);

    h.document.destroy(image).expect("destroy");
    h.document.settle().await;

    assert!(h.document.element(image).is_err());
    assert!(journal.records().is_empty());
    assert_eq!(h.pool.live_realms(), 0);
}

#[tokio::test]
async fn light_tree_and_attributes_stay_on_the_host() {
    let mut h = harness(EngineConfig::default());
    let journal = Journal::new();
    let url = module_url("card");
    h.loader
        .insert(WorkletModule::new(url.clone()).define(journal.class("x-card", &["title"])));
    h.document
        .register_module(&url)
        .await
        .expect("register module");

    let card = h
        .document
        .create_element_with("X-Card", [("title", "hello"), ("id", "main")])
        .expect("create element");
    h.document
        .append_child(card, LightNode::Element { tag_name: "p".into() })
        .unwrap();
    h.document.connect(card).unwrap();
    h.document.settle().await;

    let proxy = h.document.element(card).unwrap();
    assert_eq!(proxy.tag_name(), "x-card");
    assert_eq!(proxy.get_attribute("id"), Some("main"));
    assert_eq!(proxy.light_tree().len(), 1);
    // Only observed attributes cross the channel.
    assert_eq!(
        journal.calls_for(card),
        vec![attr("title", None, Some("hello")), Call::Connected]
    );
}
