//! Attribute sync engine: coalesces host-side attribute mutations into one
//! ordered batch per instance per scheduling tick.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::channel::AttributeChange;
use crate::host::ElementId;
use crate::registry::ElementDefinition;

pub type AttributeMap = IndexMap<String, String>;

/// What happens to attribute batches while an instance sits in its grace
/// window after disconnection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectedAttributePolicy {
    /// Batches keep flowing on schedule to the still-open channel.
    #[default]
    Deliver,
    /// Changes accumulate and are delivered just before the next `connect`.
    Defer,
}

/// The batch delivered right after realm instantiation: every observed
/// attribute currently present, as `(name, None, value)`.
pub fn initial_batch(definition: &ElementDefinition, attributes: &AttributeMap) -> Vec<AttributeChange> {
    definition
        .observed_attribute_names()
        .iter()
        .filter_map(|name| {
            attributes
                .get(name)
                .map(|value| AttributeChange::new(name.clone(), None, Some(value)))
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct AttributeSyncEngine {
    /// Per element: observed attribute name → value before its first mutation
    /// since the last flush.
    pending: BTreeMap<ElementId, HashMap<String, Option<String>>>,
    tick: u64,
}

impl AttributeSyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed ticks.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn advance(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Note a mutation of `name` whose value was `previous` just before it.
    /// Returns `false` when the attribute is not observed.
    pub fn record(
        &mut self,
        element: ElementId,
        definition: &ElementDefinition,
        name: &str,
        previous: Option<&str>,
    ) -> bool {
        if !definition.observes(name) {
            return false;
        }
        self.pending
            .entry(element)
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| previous.map(str::to_string));
        true
    }

    pub fn has_pending(&self, element: ElementId) -> bool {
        self.pending.contains_key(&element)
    }

    pub fn pending_elements(&self) -> Vec<ElementId> {
        self.pending.keys().copied().collect()
    }

    pub fn discard(&mut self, element: ElementId) {
        self.pending.remove(&element);
    }

    /// Net changes for `element` against `current`, in `observedAttributeNames`
    /// order. Attributes that ended where they started are left out.
    pub fn take_batch(
        &mut self,
        element: ElementId,
        definition: &ElementDefinition,
        current: &AttributeMap,
    ) -> Vec<AttributeChange> {
        let Some(before) = self.pending.remove(&element) else {
            return Vec::new();
        };
        definition
            .observed_attribute_names()
            .iter()
            .filter_map(|name| {
                let old_value = before.get(name)?;
                let new_value = current.get(name);
                (old_value.as_ref() != new_value).then(|| AttributeChange {
                    name: name.clone(),
                    old_value: old_value.clone(),
                    new_value: new_value.cloned(),
                })
            })
            .collect()
    }
}
