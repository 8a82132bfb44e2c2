//! Application hooks that replace generic behaviour for one field key.
//!
//! Overrides are registered on the [`EntityRegistryBuilder`](super::EntityRegistryBuilder)
//! under `(entity, field key)`. When a listing request names a key with a
//! registered override, the hook runs and generic field resolution is
//! skipped for that key.

use serde_json::Value;

use super::error::ConfigurationError;
use crate::query::{QueryContext, SortDirection};

/// Replaces search compilation for one key.
pub trait SearchOverride: Send + Sync {
    /// Add predicates for `term` to the query being built.
    fn apply(&self, ctx: &mut QueryContext<'_>, term: &str) -> Result<(), ConfigurationError>;
}

/// Replaces sort compilation for one key.
pub trait OrderOverride: Send + Sync {
    /// Append ORDER BY terms to the query being built.
    fn apply(
        &self,
        ctx: &mut QueryContext<'_>,
        direction: SortDirection,
    ) -> Result<(), ConfigurationError>;
}

/// A named validation rule that field metadata can reference through
/// `rules.custom`.
pub trait CustomRule: Send + Sync {
    /// Return a message when `value` is rejected.
    fn check(&self, field: &str, value: &Value) -> Result<(), String>;
}
