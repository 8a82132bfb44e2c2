//! Shared fixtures for unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use autocrud_test_utils::fixtures;

use crate::entity::{EntityDefinition, EntityRegistry, FieldDescriptor};

/// The shop fixture definitions, parsed.
pub(crate) fn definitions() -> Vec<EntityDefinition> {
    fixtures::shop()
        .iter()
        .map(|yaml| serde_yml::from_str(yaml).expect("fixture parses"))
        .collect()
}

/// A registry built from [`definitions`].
pub(crate) fn shop_registry() -> EntityRegistry {
    build(definitions())
}

/// The shop plus `comment`, and `order` with a `customer_address` link.
pub(crate) fn extended_registry() -> EntityRegistry {
    let mut defs = definitions();
    let ship_to: FieldDescriptor =
        serde_yml::from_str(fixtures::SHIP_ADDRESS_FIELD).expect("field parses");
    defs.iter_mut()
        .find(|d| d.name == "order")
        .expect("order fixture")
        .fields
        .push(ship_to);
    defs.push(serde_yml::from_str(fixtures::COMMENT).expect("fixture parses"));
    build(defs)
}

fn build(defs: Vec<EntityDefinition>) -> EntityRegistry {
    EntityRegistry::builder()
        .entities(defs)
        .build()
        .expect("fixture registry builds")
}
