//! Search compilation: one predicate per (key, term), AND-combined.
//!
//! Direct columns and relation columns match the whole term as a substring.
//! Composed labels match word by word, so `"ana per"` finds `"Ana Pérez"`
//! only when both words occur somewhere in the label.

use sea_query::{Alias, Expr, Query, SimpleExpr};

use super::context::{QueryContext, TrashScope};
use super::resolver::{FieldResolution, relation_path_for};
use super::sql::{contains_pattern, qualified};
use super::template::TemplateExpr;
use crate::entity::{ConfigurationError, FieldType};

/// Add the predicate for one resolved search key.
pub fn apply_search(
    ctx: &mut QueryContext<'_>,
    resolution: &FieldResolution,
    term: &str,
) -> Result<(), ConfigurationError> {
    match resolution {
        FieldResolution::CustomOverride { key } => {
            if let Some(hook) = ctx.entity().search_override(key).cloned() {
                hook.apply(ctx, term)?;
            }
        }
        FieldResolution::Direct { column, field_type } => {
            let column = qualified(ctx.base_table(), column);
            ctx.and_where(match_term(&column, *field_type, term));
        }
        FieldResolution::RelationColumn {
            relations,
            column,
            field_type,
        } => {
            let exists = relation_exists(ctx, relations, column, *field_type, term)?;
            ctx.and_where(exists);
        }
        FieldResolution::Template { scope, expr } => {
            let label = LabelSql::build(ctx, scope.as_deref(), expr)?;
            for word in term.split_whitespace() {
                ctx.and_where(label.ilike(word));
            }
        }
    }
    Ok(())
}

/// `column ILIKE '%term%'`, comparing dates in their display format.
fn match_term(column: &str, field_type: FieldType, term: &str) -> SimpleExpr {
    let pattern = contains_pattern(term);
    match field_type.display_pattern() {
        Some(format) => Expr::cust_with_values(
            format!("to_char({column}, $1) ILIKE $2"),
            [format.to_string(), pattern],
        ),
        None => Expr::cust_with_values(format!("{column}::text ILIKE $1"), [pattern]),
    }
}

/// Nested correlated `EXISTS` subqueries, one per hop, with the match on
/// the innermost one. Trashed related rows never match. No join is added
/// to the outer statement.
fn relation_exists(
    ctx: &QueryContext<'_>,
    relations: &[String],
    column: &str,
    field_type: FieldType,
    term: &str,
) -> Result<SimpleExpr, ConfigurationError> {
    let registry = ctx.registry();
    let mut entity = ctx.entity();
    let mut parent = ctx.base_table().to_string();
    let mut levels = Vec::with_capacity(relations.len());

    for (i, name) in relations.iter().enumerate() {
        let hop = registry.belongs_to(entity, name)?;
        let alias = format!("{}_match", relations[..=i].join("_"));
        levels.push((hop, alias.clone(), parent));
        parent = alias;
        entity = hop.target;
    }

    let mut predicate = match_term(&qualified(&parent, column), field_type, term);
    for (hop, alias, parent) in levels.into_iter().rev() {
        let mut sub = Query::select();
        sub.expr(Expr::cust("1"))
            .from_as(Alias::new(hop.target.table()), Alias::new(&alias))
            .and_where(
                Expr::col((Alias::new(&alias), Alias::new(hop.owner_key)))
                    .equals((Alias::new(&parent), Alias::new(hop.foreign_key))),
            )
            .and_where(predicate);
        if let Some(active) = TrashScope::Active.condition(hop.target, &alias) {
            sub.and_where(active);
        }
        predicate = Expr::exists(sub);
    }

    Ok(predicate)
}

/// SQL for a composed label: literals and joined columns concatenated.
/// `CONCAT` renders NULL columns as empty text.
pub(crate) struct LabelSql {
    sql: String,
    values: Vec<String>,
}

impl LabelSql {
    /// Joins every relation the template references.
    pub(crate) fn build(
        ctx: &mut QueryContext<'_>,
        scope: Option<&str>,
        expr: &TemplateExpr,
    ) -> Result<Self, ConfigurationError> {
        let mut parts = Vec::new();
        let mut values = Vec::new();

        for (literal, path) in expr.segments() {
            if !literal.is_empty() {
                values.push(literal.to_string());
                parts.push(format!("${}", values.len()));
            }
            if let Some(path) = path {
                let alias = ctx.ensure_join(&relation_path_for(scope, path))?;
                parts.push(qualified(&alias, path.column()));
            }
        }

        Ok(Self {
            sql: format!("CONCAT({})", parts.join(", ")),
            values,
        })
    }

    pub(crate) fn expr(&self) -> SimpleExpr {
        Expr::cust_with_values(self.sql.clone(), self.values.clone())
    }

    fn ilike(&self, word: &str) -> SimpleExpr {
        let mut values = self.values.clone();
        values.push(contains_pattern(word));
        Expr::cust_with_values(format!("{} ILIKE ${}", self.sql, values.len()), values)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::query::resolver::{Purpose, resolve};
    use crate::testing::shop_registry;

    fn search_sql(entity: &str, key: &str, term: &str) -> String {
        let registry = shop_registry();
        let entity = registry.get(entity).unwrap();
        let mut ctx = QueryContext::new(&registry, entity);
        let resolution = resolve(entity, key, Purpose::Search).unwrap();
        apply_search(&mut ctx, &resolution, term).unwrap();
        ctx.count_sql()
    }

    #[test]
    fn direct_substring_match() {
        assert_eq!(
            search_sql("order", "code", "A1"),
            r#"SELECT COUNT(*) FROM "orders" WHERE "orders"."code"::text ILIKE '%A1%'"#
        );
    }

    #[test]
    fn date_matches_display_format() {
        assert_eq!(
            search_sql("order", "placed_at", "07-03"),
            r#"SELECT COUNT(*) FROM "orders" WHERE to_char("orders"."placed_at", 'DD-MM-YYYY HH24:MI') ILIKE '%07-03%'"#
        );
    }

    #[test]
    fn relation_column_uses_nested_exists() {
        let sql = search_sql("order", "customer_country", "spain");
        assert!(!sql.contains("JOIN"), "{sql}");
        assert_eq!(sql.matches("EXISTS").count(), 3, "{sql}");
        for fragment in [
            r#"FROM "customers" AS "customer_match""#,
            r#""customer_match"."id" = "orders"."customer_id""#,
            r#"FROM "addresses" AS "customer_address_match""#,
            r#""customer_address_match"."id" = "customer_match"."address_id""#,
            r#"FROM "countries" AS "customer_address_country_match""#,
            r#""customer_address_country_match"."name"::text ILIKE '%spain%'"#,
        ] {
            assert!(sql.contains(fragment), "missing {fragment} in {sql}");
        }
    }

    #[test]
    fn relation_match_skips_trashed_rows() {
        let sql = search_sql("order", "customer_country", "spain");
        // customers soft delete, addresses and countries do not
        assert_eq!(sql.matches("deleted_at").count(), 1, "{sql}");
        assert!(
            sql.contains(r#""customer_match"."deleted_at" IS NULL"#),
            "{sql}"
        );
    }

    #[test]
    fn template_matches_each_word() {
        let sql = search_sql("order", "customer_id", "ana per");
        let label = r#"CONCAT("customer"."first_name", ' ', "customer"."last_name")"#;
        assert!(sql.contains(r#"LEFT JOIN "customers" AS "customer" ON "orders"."customer_id" = "customer"."id""#), "{sql}");
        assert!(sql.contains(&format!("{label} ILIKE '%ana%'")), "{sql}");
        assert!(sql.contains(&format!("{label} ILIKE '%per%'")), "{sql}");
        assert_eq!(sql.matches("LEFT JOIN").count(), 1);
    }

    #[test]
    fn template_words_match_in_any_order() {
        let label = r#"CONCAT("customer"."first_name", ' ', "customer"."last_name")"#;
        let ana = format!("{label} ILIKE '%Ana%'");
        let garcia = format!("{label} ILIKE '%García%'");

        for term in ["Ana García", "García Ana", "  García   Ana  "] {
            let sql = search_sql("order", "customer_id", term);
            assert_eq!(sql.matches(" ILIKE ").count(), 2, "{sql}");
            assert!(sql.contains(&ana), "{sql}");
            assert!(sql.contains(&garcia), "{sql}");
            assert!(!sql.contains("'%%'"), "{sql}");
        }

        let sql = search_sql("order", "customer_id", "García Ana");
        let first = sql.find(&garcia).unwrap();
        let second = sql.find(&ana).unwrap();
        assert!(first < second, "{sql}");
        assert!(sql[first..second].contains(" AND "), "{sql}");

        let sql = search_sql("order", "customer_id", "Ana Paz");
        assert!(sql.contains(&format!("{label} ILIKE '%Paz%'")), "{sql}");
        assert!(!sql.contains("García"), "{sql}");
    }

    #[test]
    fn template_with_multi_hop_paths_joins_once() {
        let registry = shop_registry();
        let customer = registry.get("customer").unwrap();
        let mut ctx = QueryContext::new(&registry, customer);
        let resolution = resolve(customer, "address_id", Purpose::Search).unwrap();
        apply_search(&mut ctx, &resolution, "main madrid").unwrap();

        assert_eq!(ctx.join_aliases().len(), 2);
        assert_eq!(ctx.join_aliases().get("address"), Some("address"));
        assert_eq!(
            ctx.join_aliases().get("address.country"),
            Some("address_country")
        );
        let sql = ctx.count_sql();
        assert_eq!(sql.matches("LEFT JOIN").count(), 2);
        assert_eq!(sql.matches("ILIKE").count(), 2);
    }

    #[test]
    fn whitespace_only_template_term_adds_nothing() {
        assert_eq!(
            search_sql("order", "customer_id", "   "),
            r#"SELECT COUNT(*) FROM "orders" LEFT JOIN "customers" AS "customer" ON "orders"."customer_id" = "customer"."id""#
        );
    }
}
