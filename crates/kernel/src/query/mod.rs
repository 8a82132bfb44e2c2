//! Dynamic listing query engine.
//!
//! This module provides:
//! - TemplateExpr: parsed `{path}` label templates
//! - Field resolution from request keys to compile strategies
//! - QueryContext: per-request statement with its join alias cache
//! - Search and sort compilers
//! - ListingService: count + page queries, pagination and eager loading

mod context;
pub mod eager;
mod joins;
pub mod listing;
pub mod resolver;
pub mod search;
pub mod sort;
pub mod sql;
mod template;

pub use context::{JoinAliasCache, QueryContext, SortDirection, TrashScope};
pub use eager::{EagerLoader, IncludeTree};
pub use listing::{
    InvalidListingParam, ListingRequest, ListingResponse, ListingService, PageSize, SortKey,
    TableData,
};
pub use resolver::{FieldResolution, Purpose, relation_path_for, resolve};
pub use template::{FieldPath, TemplateExpr};
