//! Errors raised while loading or resolving entity metadata.

use thiserror::Error;

/// Invalid entity metadata.
///
/// These are configuration bugs, never user input problems. They surface
/// when the registry is built and, for paths supplied by override hooks,
/// when a join is requested at query time.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("entity '{entity}' has no relation named '{relation}'")]
    UnknownRelation { entity: String, relation: String },

    #[error("entity '{entity}' declares field '{key}' more than once")]
    DuplicateField { entity: String, key: String },

    #[error("entity '{entity}' declares relation '{relation}' more than once")]
    DuplicateRelation { entity: String, relation: String },

    #[error("unsafe SQL identifier '{identifier}' in entity '{entity}'")]
    UnsafeIdentifier { entity: String, identifier: String },

    #[error("relation '{relation}' on entity '{entity}' cannot be joined (only belongs-to links are joinable)")]
    UnjoinableRelation { entity: String, relation: String },

    #[error("entity '{entity}' declares {what} '{key}' which is not a field")]
    UnknownField {
        entity: String,
        what: &'static str,
        key: String,
    },

    #[error("relation '{relation}' on entity '{entity}' is missing '{missing}'")]
    IncompleteRelation {
        entity: String,
        relation: String,
        missing: &'static str,
    },

    #[error("failed to load entity definitions: {0}")]
    Load(String),
}
