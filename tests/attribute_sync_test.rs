mod common;

use common::{attr, harness, module_url, Call, Harness, Journal};
use worklet_elements::{DisconnectedAttributePolicy, ElementId, EngineConfig, WorkletModule};

async fn resolved_image(config: EngineConfig, observed: &[&str]) -> (Harness, Journal, ElementId) {
    let mut h = harness(config);
    let journal = Journal::new();
    let url = module_url("lazy-image");
    h.loader
        .insert(WorkletModule::new(url.clone()).define(journal.class("lazy-image", observed)));
    h.document
        .register_module(&url)
        .await
        .expect("register module");

    let image = h
        .document
        .create_element_with("lazy-image", [("src", "cat.jpeg")])
        .expect("create element");
    h.document.connect(image).expect("connect");
    h.document.settle().await;
    (h, journal, image)
}

/// Calls recorded after the initial `[src batch, connected]` pair.
fn later_calls(journal: &Journal, element: ElementId) -> Vec<Call> {
    journal.calls_for(element).into_iter().skip(2).collect()
}

#[tokio::test]
async fn mutations_within_a_tick_arrive_as_one_net_change() {
    let (mut h, journal, image) = resolved_image(EngineConfig::default(), &["src"]).await;

    h.document.set_attribute(image, "src", "dog.png").unwrap();
    h.document.set_attribute(image, "src", "fox.png").unwrap();
    h.document.tick();
    h.document.settle().await;

    assert_eq!(
        later_calls(&journal, image),
        vec![attr("src", Some("cat.jpeg"), Some("fox.png"))]
    );
}

#[tokio::test]
async fn each_tick_delivers_its_own_batch() {
    let (mut h, journal, image) = resolved_image(EngineConfig::default(), &["src"]).await;

    h.document.set_attribute(image, "src", "dog.png").unwrap();
    let first = h.document.tick();
    h.document.set_attribute(image, "src", "fox.png").unwrap();
    let second = h.document.tick();
    h.document.settle().await;

    assert_eq!(second, first + 1);
    assert_eq!(
        later_calls(&journal, image),
        vec![
            attr("src", Some("cat.jpeg"), Some("dog.png")),
            attr("src", Some("dog.png"), Some("fox.png")),
        ]
    );
}

#[tokio::test]
async fn batch_entries_follow_observed_attribute_order() {
    let (mut h, journal, image) =
        resolved_image(EngineConfig::default(), &["width", "src", "alt"]).await;

    h.document.set_attribute(image, "alt", "a cat").unwrap();
    h.document.set_attribute(image, "src", "dog.png").unwrap();
    h.document.set_attribute(image, "width", "320").unwrap();
    h.document.tick();
    h.document.settle().await;

    assert_eq!(
        later_calls(&journal, image),
        vec![
            attr("width", None, Some("320")),
            attr("src", Some("cat.jpeg"), Some("dog.png")),
            attr("alt", None, Some("a cat")),
        ]
    );
}

#[tokio::test]
async fn unobserved_and_reverted_attributes_stay_on_the_host() {
    let (mut h, journal, image) = resolved_image(EngineConfig::default(), &["src"]).await;

    h.document.set_attribute(image, "class", "hero").unwrap();
    h.document.set_attribute(image, "src", "dog.png").unwrap();
    h.document.set_attribute(image, "src", "cat.jpeg").unwrap();
    h.document.tick();
    h.document.settle().await;

    assert!(later_calls(&journal, image).is_empty());
    assert_eq!(h.document.get_attribute(image, "class").unwrap(), Some("hero"));
}

#[tokio::test]
async fn removal_is_delivered_with_absent_new_value() {
    let (mut h, journal, image) = resolved_image(EngineConfig::default(), &["src"]).await;

    let removed = h.document.remove_attribute(image, "src").unwrap();
    assert_eq!(removed.as_deref(), Some("cat.jpeg"));
    assert_eq!(h.document.remove_attribute(image, "src").unwrap(), None);
    h.document.tick();
    h.document.settle().await;

    assert_eq!(
        later_calls(&journal, image),
        vec![attr("src", Some("cat.jpeg"), None)]
    );
}

#[tokio::test]
async fn invalid_attribute_names_are_rejected() {
    let (mut h, _journal, image) = resolved_image(EngineConfig::default(), &["src"]).await;

    assert!(h.document.set_attribute(image, "bad name", "x").is_err());
    assert!(h
        .document
        .create_element_with("lazy-image", [("a=b", "x")])
        .is_err());
}

#[tokio::test]
async fn batches_keep_flowing_while_disconnected_by_default() {
    let (mut h, journal, image) = resolved_image(EngineConfig::default(), &["src"]).await;

    h.document.disconnect(image).unwrap();
    h.document.set_attribute(image, "src", "dog.png").unwrap();
    h.document.tick();
    h.document.settle().await;

    assert_eq!(
        later_calls(&journal, image),
        vec![
            Call::Disconnected,
            attr("src", Some("cat.jpeg"), Some("dog.png")),
        ]
    );
}

#[tokio::test]
async fn deferred_batches_are_delivered_before_reconnect() {
    let config = EngineConfig {
        disconnected_attributes: DisconnectedAttributePolicy::Defer,
        ..EngineConfig::default()
    };
    let (mut h, journal, image) = resolved_image(config, &["src"]).await;

    h.document.disconnect(image).unwrap();
    h.document.set_attribute(image, "src", "dog.png").unwrap();
    h.document.tick();
    h.document.set_attribute(image, "src", "fox.png").unwrap();
    h.document.tick();
    h.document.settle().await;
    assert_eq!(later_calls(&journal, image), vec![Call::Disconnected]);

    h.document.connect(image).unwrap();
    h.document.settle().await;

    assert_eq!(
        later_calls(&journal, image),
        vec![
            Call::Disconnected,
            attr("src", Some("cat.jpeg"), Some("fox.png")),
            Call::Connected,
        ]
    );
}
