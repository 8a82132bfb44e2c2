//! Per-request query state.
//!
//! A [`QueryContext`] owns the statement under construction for one listing
//! request, the ORDER BY terms collected so far and the join alias cache.
//! It is created per request and never shared.

use std::collections::HashMap;

use sea_query::{Alias, Expr, Order, PostgresQueryBuilder, Query, SelectStatement, SimpleExpr};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::{Entity, EntityRegistry};

/// ORDER BY direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    /// Case-insensitive `asc` / `desc`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

impl From<SortDirection> for Order {
    fn from(direction: SortDirection) -> Self {
        match direction {
            SortDirection::Asc => Order::Asc,
            SortDirection::Desc => Order::Desc,
        }
    }
}

/// Which rows of a soft-deleting entity are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrashScope {
    /// Only rows with `deleted_at IS NULL`.
    Active,
    /// Only rows with `deleted_at IS NOT NULL`.
    OnlyTrashed,
    /// Every row.
    WithTrashed,
}

impl TrashScope {
    /// Scope of a listing: trashed rows only when asked for and supported.
    pub fn for_listing(entity: &Entity, deleted: bool) -> Self {
        match (entity.soft_deletes(), deleted) {
            (true, true) => TrashScope::OnlyTrashed,
            (true, false) => TrashScope::Active,
            (false, _) => TrashScope::WithTrashed,
        }
    }

    /// Predicate for `alias`, or `None` when no filtering is needed.
    pub fn condition(self, entity: &Entity, alias: &str) -> Option<SimpleExpr> {
        if !entity.soft_deletes() {
            return None;
        }
        let column = Expr::col((Alias::new(alias), Alias::new("deleted_at")));
        match self {
            TrashScope::Active => Some(column.is_null()),
            TrashScope::OnlyTrashed => Some(column.is_not_null()),
            TrashScope::WithTrashed => None,
        }
    }
}

/// Join aliases created during one request, keyed by canonical relation
/// path (`customer.address`).
#[derive(Debug, Clone, Default)]
pub struct JoinAliasCache {
    aliases: HashMap<String, String>,
}

impl JoinAliasCache {
    pub fn get(&self, path: &str) -> Option<&str> {
        self.aliases.get(path).map(String::as_str)
    }

    pub(crate) fn insert(&mut self, path: String, alias: String) {
        self.aliases.insert(path, alias);
    }

    /// `preferred`, or the first of `preferred_2`, `preferred_3`, ... that
    /// neither an earlier join nor `reserved` uses.
    pub(crate) fn free_alias(&self, preferred: &str, reserved: &str) -> String {
        let taken = |alias: &str| alias == reserved || self.aliases.values().any(|a| a == alias);
        let mut alias = preferred.to_string();
        let mut n = 2;
        while taken(&alias) {
            alias = format!("{preferred}_{n}");
            n += 1;
        }
        alias
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Statement under construction for one entity.
pub struct QueryContext<'a> {
    registry: &'a EntityRegistry,
    entity: &'a Entity,
    pub(crate) query: SelectStatement,
    orders: Vec<(SimpleExpr, Order)>,
    pub(crate) joins: JoinAliasCache,
    ignored_keys: Vec<String>,
}

impl<'a> QueryContext<'a> {
    pub fn new(registry: &'a EntityRegistry, entity: &'a Entity) -> Self {
        let mut query = Query::select();
        query.from(Alias::new(entity.table()));

        Self {
            registry,
            entity,
            query,
            orders: Vec::new(),
            joins: JoinAliasCache::default(),
            ignored_keys: Vec::new(),
        }
    }

    pub fn registry(&self) -> &'a EntityRegistry {
        self.registry
    }

    pub fn entity(&self) -> &'a Entity {
        self.entity
    }

    /// Base table name, which is also its alias in the statement.
    pub fn base_table(&self) -> &'a str {
        self.entity.table()
    }

    /// Add a predicate; predicates are AND-combined.
    pub fn and_where(&mut self, expr: SimpleExpr) {
        self.query.and_where(expr);
    }

    /// Append an ORDER BY term after the ones already present.
    pub fn order_by(&mut self, expr: SimpleExpr, direction: SortDirection) {
        self.orders.push((expr, direction.into()));
    }

    pub fn has_orders(&self) -> bool {
        !self.orders.is_empty()
    }

    pub fn join_aliases(&self) -> &JoinAliasCache {
        &self.joins
    }

    /// Record a request key that resolved to nothing.
    pub fn ignore_key(&mut self, key: &str, purpose: &str) {
        warn!(
            entity = %self.entity.name(),
            key = %key,
            purpose = %purpose,
            "ignoring unknown listing key"
        );
        self.ignored_keys.push(key.to_string());
    }

    pub fn ignored_keys(&self) -> &[String] {
        &self.ignored_keys
    }

    /// `SELECT COUNT(*)` over the filtered set; joins are kept, ordering is
    /// dropped.
    pub fn count_sql(&self) -> String {
        let mut query = self.query.clone();
        query.expr(Expr::cust("COUNT(*)"));
        query.to_string(PostgresQueryBuilder)
    }

    /// One page of base rows, each serialized with `row_to_json`.
    pub fn page_sql(&self, limit: u64, offset: u64) -> String {
        let mut query = self.query.clone();
        query.expr_as(
            Expr::cust(format!("row_to_json({})", super::sql::quote(self.base_table()))),
            Alias::new("row"),
        );
        for (expr, order) in &self.orders {
            query.order_by_expr(expr.clone(), order.clone());
        }
        query.limit(limit).offset(offset);
        query.to_string(PostgresQueryBuilder)
    }
}
