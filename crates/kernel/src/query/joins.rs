//! LEFT JOIN planning for belongs-to chains.
//!
//! Each distinct relation path is joined at most once per statement; the
//! alias is derived from the path (`customer.address` becomes
//! `customer_address`) and reused for every later reference. A derived
//! alias already used by another path or by the base table gets a numeric
//! suffix.

use sea_query::{Alias, Expr, JoinType};
use tracing::debug;

use super::context::QueryContext;
use crate::entity::ConfigurationError;

impl QueryContext<'_> {
    /// Make sure every hop of `path` is joined and return the alias of the
    /// last one. An empty path names the base table.
    pub fn ensure_join<S: AsRef<str>>(&mut self, path: &[S]) -> Result<String, ConfigurationError> {
        let registry = self.registry();
        let mut entity = self.entity();
        let mut previous = self.base_table().to_string();

        let hops: Vec<&str> = path.iter().map(AsRef::as_ref).collect();
        for i in 0..hops.len() {
            let hop = registry.belongs_to(entity, hops[i])?;
            let canonical = hops[..=i].join(".");

            let alias = match self.joins.get(&canonical) {
                Some(alias) => alias.to_string(),
                None => {
                    let preferred = hops[..=i].join("_");
                    let alias = self.joins.free_alias(&preferred, self.base_table());
                    let on = Expr::col((Alias::new(&previous), Alias::new(hop.foreign_key)))
                        .equals((Alias::new(&alias), Alias::new(hop.owner_key)));
                    self.query.join_as(
                        JoinType::LeftJoin,
                        Alias::new(hop.target.table()),
                        Alias::new(&alias),
                        on,
                    );
                    debug!(path = %canonical, alias = %alias, table = %hop.target.table(), "join added");
                    self.joins.insert(canonical, alias.clone());
                    alias
                }
            };

            previous = alias;
            entity = hop.target;
        }

        Ok(previous)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{extended_registry, shop_registry};

    #[test]
    fn joins_each_path_once() {
        let registry = shop_registry();
        let order = registry.get("order").unwrap();
        let mut ctx = QueryContext::new(&registry, order);

        let first = ctx.ensure_join(&["customer", "address"]).unwrap();
        let second = ctx.ensure_join(&["customer", "address"]).unwrap();
        let prefix = ctx.ensure_join(&["customer"]).unwrap();

        assert_eq!(first, "customer_address");
        assert_eq!(second, first);
        assert_eq!(prefix, "customer");
        assert_eq!(ctx.join_aliases().len(), 2);

        let sql = ctx.count_sql();
        assert_eq!(
            sql,
            concat!(
                r#"SELECT COUNT(*) FROM "orders" "#,
                r#"LEFT JOIN "customers" AS "customer" ON "orders"."customer_id" = "customer"."id" "#,
                r#"LEFT JOIN "addresses" AS "customer_address" ON "customer"."address_id" = "customer_address"."id""#
            )
        );
    }

    #[test]
    fn colliding_derived_aliases_get_suffixes() {
        let registry = extended_registry();
        let order = registry.get("order").unwrap();
        let mut ctx = QueryContext::new(&registry, order);

        let ship_to = ctx.ensure_join(&["customer_address"]).unwrap();
        let billing = ctx.ensure_join(&["customer", "address"]).unwrap();
        assert_eq!(ship_to, "customer_address");
        assert_eq!(billing, "customer_address_2");
        assert_eq!(ctx.ensure_join(&["customer", "address"]).unwrap(), billing);
        assert_eq!(ctx.ensure_join(&["customer_address"]).unwrap(), ship_to);

        let sql = ctx.count_sql();
        assert_eq!(sql.matches("LEFT JOIN").count(), 3, "{sql}");
        assert!(
            sql.contains(r#"LEFT JOIN "addresses" AS "customer_address" ON "orders"."ship_address_id" = "customer_address"."id""#),
            "{sql}"
        );
        assert!(
            sql.contains(r#"LEFT JOIN "addresses" AS "customer_address_2" ON "customer"."address_id" = "customer_address_2"."id""#),
            "{sql}"
        );
    }

    #[test]
    fn empty_path_is_base_table() {
        let registry = shop_registry();
        let mut ctx = QueryContext::new(&registry, registry.get("order").unwrap());
        assert_eq!(ctx.ensure_join::<&str>(&[]).unwrap(), "orders");
        assert!(ctx.join_aliases().is_empty());
    }

    #[test]
    fn rejects_non_belongs_to_hops() {
        let registry = shop_registry();
        let mut ctx = QueryContext::new(&registry, registry.get("order").unwrap());
        assert!(matches!(
            ctx.ensure_join(&["tags"]),
            Err(ConfigurationError::UnjoinableRelation { .. })
        ));
        assert!(matches!(
            ctx.ensure_join(&["ghost"]),
            Err(ConfigurationError::UnknownRelation { .. })
        ));
    }
}
