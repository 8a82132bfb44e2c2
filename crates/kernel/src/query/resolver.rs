//! Field resolution: from a request key to the strategy used to search or
//! sort it.

use crate::entity::{Entity, FieldType};

use super::template::{FieldPath, TemplateExpr};

/// What a request key is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Search,
    Order,
}

/// How a key is compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldResolution {
    /// An application hook registered for this key does the work.
    CustomOverride { key: String },

    /// A column of the base table.
    Direct { column: String, field_type: FieldType },

    /// A column reached through a chain of belongs-to relations.
    RelationColumn {
        relations: Vec<String>,
        column: String,
        field_type: FieldType,
    },

    /// A composed label. With a `scope`, every placeholder path is relative
    /// to that relation of the base entity.
    Template {
        scope: Option<String>,
        expr: TemplateExpr,
    },
}

/// Relation hops for a template placeholder.
///
/// Inside a relation scope `R`, `{f}` addresses `R.f` and `{x.y.f}`
/// addresses `R.x.y.f`.
pub fn relation_path_for(scope: Option<&str>, path: &FieldPath) -> Vec<String> {
    scope
        .into_iter()
        .chain(path.relations())
        .map(str::to_string)
        .collect()
}

/// Resolve `key` against the table fields of `entity`.
///
/// Precedence: registered override, explicit `search_key` / `order_key`,
/// the relation's `table_key` (then `form_key`), and finally the column
/// named by the key itself. Returns `None` for keys that are not listed
/// table fields and for polymorphic relation fields without an explicit
/// key, whose target table is only known per row.
pub fn resolve(entity: &Entity, key: &str, purpose: Purpose) -> Option<FieldResolution> {
    let has_override = match purpose {
        Purpose::Search => entity.search_override(key).is_some(),
        Purpose::Order => entity.order_override(key).is_some(),
    };
    if has_override {
        return Some(FieldResolution::CustomOverride {
            key: key.to_string(),
        });
    }

    let field = entity.definition().table_fields().find(|f| f.key == key)?;

    let explicit = match purpose {
        Purpose::Search => field.search_key.as_deref(),
        Purpose::Order => field.order_key.as_deref(),
    };
    if let Some(raw) = explicit {
        return Some(from_key(raw, field.field_type));
    }

    if let Some(rel) = &field.relation {
        if rel.polymorphic {
            return None;
        }
        if let Some(template) = rel.table_key.as_ref().or(rel.form_key.as_ref()) {
            if template.is_plain() {
                let path = FieldPath::new(template.to_string());
                let mut relations = vec![rel.name.clone()];
                relations.extend(path.relations().into_iter().map(str::to_string));
                return Some(FieldResolution::RelationColumn {
                    relations,
                    column: path.column().to_string(),
                    field_type: FieldType::String,
                });
            }
            return Some(FieldResolution::Template {
                scope: Some(rel.name.clone()),
                expr: template.clone(),
            });
        }
    }

    Some(FieldResolution::Direct {
        column: field.key.clone(),
        field_type: field.field_type,
    })
}

/// An explicit search/order key: a template, a dotted path or a column.
fn from_key(raw: &str, field_type: FieldType) -> FieldResolution {
    let template = TemplateExpr::parse(raw);
    if !template.is_plain() {
        return FieldResolution::Template {
            scope: None,
            expr: template,
        };
    }

    let path = FieldPath::new(raw);
    let relations = path.relations();
    if relations.is_empty() {
        FieldResolution::Direct {
            column: raw.to_string(),
            field_type,
        }
    } else {
        FieldResolution::RelationColumn {
            relations: relations.into_iter().map(str::to_string).collect(),
            column: path.column().to_string(),
            field_type,
        }
    }
}
