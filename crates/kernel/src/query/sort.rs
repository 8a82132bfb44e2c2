//! Sort compilation. Unlike search, relation columns are joined so the
//! ORDER BY can reference them directly.

use sea_query::{Alias, Expr};

use super::context::{QueryContext, SortDirection};
use super::resolver::FieldResolution;
use super::search::LabelSql;
use crate::entity::ConfigurationError;

/// Append the ORDER BY term for one resolved sort key.
pub fn apply_sort(
    ctx: &mut QueryContext<'_>,
    resolution: &FieldResolution,
    direction: SortDirection,
) -> Result<(), ConfigurationError> {
    match resolution {
        FieldResolution::CustomOverride { key } => {
            if let Some(hook) = ctx.entity().order_override(key).cloned() {
                hook.apply(ctx, direction)?;
            }
        }
        FieldResolution::Direct { column, .. } => {
            let base = ctx.base_table();
            ctx.order_by(
                Expr::col((Alias::new(base), Alias::new(column))).into(),
                direction,
            );
        }
        FieldResolution::RelationColumn {
            relations, column, ..
        } => {
            let alias = ctx.ensure_join(relations)?;
            ctx.order_by(
                Expr::col((Alias::new(&alias), Alias::new(column))).into(),
                direction,
            );
        }
        FieldResolution::Template { scope, expr } => {
            let label = LabelSql::build(ctx, scope.as_deref(), expr)?;
            ctx.order_by(label.expr(), direction);
        }
    }
    Ok(())
}

/// `ORDER BY <base>.id DESC`, used when nothing else orders the listing.
pub fn apply_default_order(ctx: &mut QueryContext<'_>) {
    let base = ctx.base_table();
    ctx.order_by(
        Expr::col((Alias::new(base), Alias::new("id"))).into(),
        SortDirection::Desc,
    );
}
