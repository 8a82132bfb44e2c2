//! Entity metadata.
//!
//! This module provides:
//! - Types: EntityDefinition, FieldDescriptor, RelationRef, FieldType, etc.
//! - Relation resolution into tagged RelationKind values
//! - EntityRegistry: validated, immutable set of entities plus override hooks
//! - Row casts and the `model` description served to clients

pub mod casts;
pub mod describe;
mod error;
mod overrides;
mod registry;
mod relation;
pub mod types;

pub use error::ConfigurationError;
pub use overrides::{CustomRule, OrderOverride, SearchOverride};
pub use registry::{Entity, EntityRegistry, EntityRegistryBuilder, JoinHop, load_definitions};
pub use relation::{Relation, RelationKind, resolve_relations};
pub use types::{
    CalendarSpec, EntityDefinition, ExternalKind, ExternalRelationRef, FieldDescriptor,
    FieldRules, FieldType, RelationRef,
};
