//! Batched eager loading of relations into JSON rows.
//!
//! Every relation of the listed entity is loaded, plus the nested paths
//! declared in `includes`. Each relation costs one query per level (one
//! per target entity for polymorphic links), whatever the number of rows.
//! Related rows are loaded whether or not they are soft-deleted.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use sea_query::{Alias, Expr, JoinType, Order, PostgresQueryBuilder, Query, SelectStatement};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;

use super::context::TrashScope;
use super::sql::{qualified, quote};
use crate::entity::{ConfigurationError, Entity, EntityRegistry, RelationKind, casts};

/// Maximum nesting depth for includes.
const MAX_INCLUDE_DEPTH: u8 = 3;

const RELATED: &str = "related";
const PIVOT: &str = "pivot";

/// Relation names to load, each with the nested relations below it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeTree {
    children: Vec<(String, IncludeTree)>,
}

impl IncludeTree {
    /// All relations of `entity` plus its declared include paths.
    pub fn for_entity(entity: &Entity) -> Self {
        let mut tree = Self::default();
        for relation in entity.relations() {
            tree.insert(&relation.name);
        }
        for include in &entity.definition().includes {
            tree.insert(include);
        }
        tree
    }

    /// Add a dotted path, creating intermediate nodes.
    pub fn insert(&mut self, path: &str) {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.child_mut(segment);
        }
    }

    fn child_mut(&mut self, name: &str) -> &mut IncludeTree {
        let index = match self.children.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.children.push((name.to_string(), IncludeTree::default()));
                self.children.len() - 1
            }
        };
        &mut self.children[index].1
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Every node as a dotted path, depth first.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, child) in &self.children {
            out.push(name.clone());
            out.extend(child.paths().into_iter().map(|p| format!("{name}.{p}")));
        }
        out
    }
}

/// Loads relations for rows of one entity.
pub struct EagerLoader<'a> {
    pool: &'a PgPool,
    registry: &'a EntityRegistry,
}

impl<'a> EagerLoader<'a> {
    pub fn new(pool: &'a PgPool, registry: &'a EntityRegistry) -> Self {
        Self { pool, registry }
    }

    /// Attach every relation of `entity` to `rows`, in place.
    pub async fn load(&self, entity: &Entity, rows: &mut [Value]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let tree = IncludeTree::for_entity(entity);
        self.load_tree(entity, rows, &tree, 0).await
    }

    fn load_tree<'b>(
        &'b self,
        entity: &'b Entity,
        rows: &'b mut [Value],
        tree: &'b IncludeTree,
        depth: u8,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'b>> {
        Box::pin(async move {
            if depth >= MAX_INCLUDE_DEPTH {
                warn!(
                    entity = %entity.name(),
                    depth,
                    "include depth limit ({MAX_INCLUDE_DEPTH}) reached, skipping nested includes"
                );
                return Ok(());
            }

            for (name, subtree) in &tree.children {
                let relation =
                    entity
                        .relation(name)
                        .ok_or_else(|| ConfigurationError::UnknownRelation {
                            entity: entity.name().to_string(),
                            relation: name.clone(),
                        })?;

                match &relation.kind {
                    RelationKind::BelongsTo {
                        related,
                        foreign_key,
                        owner_key,
                    } => {
                        let target = self.registry.require(related)?;
                        let keys = distinct_keys(rows.iter(), foreign_key);
                        let mut children = self.fetch(target, owner_key, &keys).await?;
                        self.finish(target, &mut children, subtree, depth).await?;
                        attach_one(rows.iter_mut(), name, foreign_key, &children, owner_key);
                    }
                    RelationKind::MorphTo {
                        type_column,
                        foreign_key,
                        owner_key,
                    } => {
                        self.load_morph(rows, name, type_column, foreign_key, owner_key, subtree, depth)
                            .await?;
                    }
                    RelationKind::HasMany {
                        related,
                        foreign_key,
                        local_key,
                    } => {
                        let target = self.registry.require(related)?;
                        let keys = distinct_keys(rows.iter(), local_key);
                        let mut children = self.fetch(target, foreign_key, &keys).await?;
                        self.finish(target, &mut children, subtree, depth).await?;
                        attach_many(rows, name, local_key, &children, |child| {
                            field_text(child, foreign_key)
                        });
                    }
                    RelationKind::BelongsToMany {
                        related,
                        pivot_table,
                        foreign_key,
                        related_key,
                        local_key,
                    } => {
                        let target = self.registry.require(related)?;
                        let keys = distinct_keys(rows.iter(), local_key);
                        let mut children = self
                            .fetch_through_pivot(target, pivot_table, foreign_key, related_key, &keys)
                            .await?;
                        self.finish(target, &mut children, subtree, depth).await?;
                        attach_many(rows, name, local_key, &children, |child| {
                            child.get(PIVOT).and_then(|p| field_text(p, foreign_key))
                        });
                    }
                }
            }

            Ok(())
        })
    }

    /// Nested includes first (they read raw key columns), then output casts.
    async fn finish(
        &self,
        target: &Entity,
        children: &mut [Value],
        subtree: &IncludeTree,
        depth: u8,
    ) -> Result<()> {
        if !subtree.is_empty() && !children.is_empty() {
            self.load_tree(target, children, subtree, depth + 1).await?;
        }
        casts::shape_rows(target.definition(), children);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_morph(
        &self,
        rows: &mut [Value],
        name: &str,
        type_column: &str,
        foreign_key: &str,
        owner_key: &str,
        subtree: &IncludeTree,
        depth: u8,
    ) -> Result<()> {
        for row in rows.iter_mut() {
            if let Some(obj) = row.as_object_mut() {
                obj.insert(name.to_string(), Value::Null);
            }
        }

        let types = distinct_keys(rows.iter(), type_column);
        for type_name in types {
            let Some(target) = self.registry.get(&type_name) else {
                warn!(relation = %name, morph_type = %type_name, "unknown polymorphic type, leaving relation empty");
                continue;
            };

            let keys = distinct_keys(
                rows.iter().filter(|r| has_type(r, type_column, &type_name)),
                foreign_key,
            );
            let mut children = self.fetch(target, owner_key, &keys).await?;
            self.finish(target, &mut children, subtree, depth).await?;
            attach_one(
                rows.iter_mut()
                    .filter(|r| has_type(r, type_column, &type_name)),
                name,
                foreign_key,
                &children,
                owner_key,
            );
        }
        Ok(())
    }

    /// Rows of `target` whose `key_column` is one of `keys`.
    async fn fetch(&self, target: &Entity, key_column: &str, keys: &[String]) -> Result<Vec<Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = related_select(target);
        query.and_where(
            Expr::expr(Expr::cust(format!("{}::text", qualified(RELATED, key_column))))
                .is_in(keys.iter().cloned()),
        );
        let sql = query.to_string(PostgresQueryBuilder);

        sqlx::query_scalar(&sql)
            .fetch_all(self.pool)
            .await
            .with_context(|| format!("failed to eager load {}", target.name()))
    }

    /// Rows of `target` linked through `pivot_table`, each carrying its pivot
    /// row under `pivot`.
    async fn fetch_through_pivot(
        &self,
        target: &Entity,
        pivot_table: &str,
        foreign_key: &str,
        related_key: &str,
        keys: &[String],
    ) -> Result<Vec<Value>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = related_select(target);
        query
            .expr_as(
                Expr::cust(format!("row_to_json({})", quote(PIVOT))),
                Alias::new(PIVOT),
            )
            .join_as(
                JoinType::InnerJoin,
                Alias::new(pivot_table),
                Alias::new(PIVOT),
                Expr::col((Alias::new(PIVOT), Alias::new(related_key)))
                    .equals((Alias::new(RELATED), Alias::new("id"))),
            )
            .and_where(
                Expr::expr(Expr::cust(format!("{}::text", qualified(PIVOT, foreign_key))))
                    .is_in(keys.iter().cloned()),
            );
        let sql = query.to_string(PostgresQueryBuilder);

        let pairs: Vec<(Value, Value)> = sqlx::query_as(&sql)
            .fetch_all(self.pool)
            .await
            .with_context(|| format!("failed to eager load {} through {pivot_table}", target.name()))?;

        Ok(pairs
            .into_iter()
            .map(|(mut row, pivot)| {
                if let Some(obj) = row.as_object_mut() {
                    obj.insert(PIVOT.to_string(), pivot);
                }
                row
            })
            .collect())
    }
}

/// `SELECT row_to_json(related) AS row FROM <table> AS related`, trashed
/// rows included, ordered by id.
fn related_select(target: &Entity) -> SelectStatement {
    let mut query = Query::select();
    query
        .expr_as(
            Expr::cust(format!("row_to_json({})", quote(RELATED))),
            Alias::new("row"),
        )
        .from_as(Alias::new(target.table()), Alias::new(RELATED))
        .order_by((Alias::new(RELATED), Alias::new("id")), Order::Asc);
    if let Some(condition) = TrashScope::WithTrashed.condition(target, RELATED) {
        query.and_where(condition);
    }
    query
}

/// A JSON field as comparable text; null and missing are `None`.
fn field_text(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn has_type(row: &Value, type_column: &str, type_name: &str) -> bool {
    field_text(row, type_column).as_deref() == Some(type_name)
}

fn distinct_keys<'v>(rows: impl Iterator<Item = &'v Value>, field: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    rows.filter_map(|row| field_text(row, field))
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

fn attach_one<'v>(
    rows: impl Iterator<Item = &'v mut Value>,
    name: &str,
    local_field: &str,
    children: &[Value],
    child_field: &str,
) {
    for row in rows {
        let key = field_text(row, local_field);
        let matched = key
            .as_ref()
            .and_then(|key| {
                children
                    .iter()
                    .find(|child| field_text(child, child_field).as_ref() == Some(key))
            })
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(obj) = row.as_object_mut() {
            obj.insert(name.to_string(), matched);
        }
    }
}

fn attach_many(
    rows: &mut [Value],
    name: &str,
    local_field: &str,
    children: &[Value],
    child_key: impl Fn(&Value) -> Option<String>,
) {
    for row in rows.iter_mut() {
        let key = field_text(row, local_field);
        let matched: Vec<Value> = match &key {
            Some(key) => children
                .iter()
                .filter(|child| child_key(child).as_ref() == Some(key))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        if let Some(obj) = row.as_object_mut() {
            obj.insert(name.to_string(), Value::Array(matched));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::shop_registry;
    use serde_json::json;

    #[test]
    fn include_tree_merges_relations_and_paths() {
        let registry = shop_registry();
        let order = registry.get("order").unwrap();
        let tree = IncludeTree::for_entity(order);
        assert_eq!(
            tree.paths(),
            ["customer", "customer.address", "customer.address.country", "tags", "lines"]
        );
    }

    #[test]
    fn related_select_includes_trashed_rows() {
        let registry = shop_registry();
        let customer = registry.get("customer").unwrap();
        assert!(customer.soft_deletes());
        assert_eq!(
            related_select(customer).to_string(PostgresQueryBuilder),
            r#"SELECT row_to_json("related") AS "row" FROM "customers" AS "related" ORDER BY "related"."id" ASC"#
        );
    }

    #[test]
    fn distinct_keys_skip_nulls_and_duplicates() {
        let rows = [
            json!({"customer_id": 1}),
            json!({"customer_id": "1"}),
            json!({"customer_id": null}),
            json!({"customer_id": 2}),
            json!({}),
        ];
        assert_eq!(distinct_keys(rows.iter(), "customer_id"), ["1", "2"]);
    }

    #[test]
    fn attach_one_matches_by_text() {
        let mut rows = vec![json!({"customer_id": 2}), json!({"customer_id": null})];
        let children = [json!({"id": 1, "name": "A"}), json!({"id": 2, "name": "B"})];
        attach_one(rows.iter_mut(), "customer", "customer_id", &children, "id");
        assert_eq!(rows[0]["customer"]["name"], "B");
        assert_eq!(rows[1]["customer"], Value::Null);
    }

    #[test]
    fn attach_many_groups_children() {
        let mut rows = vec![json!({"id": 1}), json!({"id": 2})];
        let children = [
            json!({"id": 10, "order_id": 1}),
            json!({"id": 11, "order_id": 1}),
            json!({"id": 12, "order_id": 3}),
        ];
        attach_many(&mut rows, "lines", "id", &children, |c| field_text(c, "order_id"));
        assert_eq!(rows[0]["lines"].as_array().unwrap().len(), 2);
        assert_eq!(rows[1]["lines"], json!([]));
    }
}
