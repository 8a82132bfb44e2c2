//! Relations resolved from entity metadata.
//!
//! Field relations and external relations are turned once, at registry
//! build time, into tagged [`RelationKind`] values looked up by name.

use super::error::ConfigurationError;
use super::types::{EntityDefinition, ExternalKind};

/// How a named relation links the owning row to related rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// `owner.foreign_key = related.owner_key`; yields one row or null.
    BelongsTo {
        related: String,
        foreign_key: String,
        owner_key: String,
    },
    /// Like belongs-to, but the related entity name is read per row from
    /// `type_column`.
    MorphTo {
        type_column: String,
        foreign_key: String,
        owner_key: String,
    },
    /// `related.foreign_key = owner.local_key`; yields many rows.
    HasMany {
        related: String,
        foreign_key: String,
        local_key: String,
    },
    /// Rows linked through a pivot table; each related row carries the
    /// pivot columns under `pivot`.
    BelongsToMany {
        related: String,
        pivot_table: String,
        foreign_key: String,
        related_key: String,
        local_key: String,
    },
}

impl RelationKind {
    /// Related entity name, when it is fixed by metadata.
    pub fn related(&self) -> Option<&str> {
        match self {
            RelationKind::BelongsTo { related, .. }
            | RelationKind::HasMany { related, .. }
            | RelationKind::BelongsToMany { related, .. } => Some(related),
            RelationKind::MorphTo { .. } => None,
        }
    }

    /// Whether the relation yields at most one row.
    pub fn is_singular(&self) -> bool {
        matches!(
            self,
            RelationKind::BelongsTo { .. } | RelationKind::MorphTo { .. }
        )
    }
}

/// A named relation of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
}

/// Resolve every relation declared by an entity, field relations first.
pub fn resolve_relations(def: &EntityDefinition) -> Result<Vec<Relation>, ConfigurationError> {
    let mut relations: Vec<Relation> = Vec::new();

    let mut push = |relation: Relation| {
        if relations.iter().any(|r| r.name == relation.name) {
            return Err(ConfigurationError::DuplicateRelation {
                entity: def.name.clone(),
                relation: relation.name,
            });
        }
        relations.push(relation);
        Ok(())
    };

    for field in &def.fields {
        let Some(rel) = &field.relation else {
            continue;
        };

        let kind = if rel.polymorphic {
            RelationKind::MorphTo {
                type_column: rel
                    .morph_type
                    .clone()
                    .unwrap_or_else(|| format!("{}_type", rel.name)),
                foreign_key: field.key.clone(),
                owner_key: rel.owner_key.clone(),
            }
        } else {
            RelationKind::BelongsTo {
                related: rel.entity.clone(),
                foreign_key: field.key.clone(),
                owner_key: rel.owner_key.clone(),
            }
        };

        push(Relation {
            name: rel.name.clone(),
            kind,
        })?;
    }

    for ext in &def.external_relations {
        let kind = match ext.kind {
            ExternalKind::HasMany => RelationKind::HasMany {
                related: ext.entity.clone(),
                foreign_key: ext.foreign_key.clone(),
                local_key: ext.local_key.clone(),
            },
            ExternalKind::BelongsToMany => {
                let missing = |what: &'static str| ConfigurationError::IncompleteRelation {
                    entity: def.name.clone(),
                    relation: ext.name.clone(),
                    missing: what,
                };
                RelationKind::BelongsToMany {
                    related: ext.entity.clone(),
                    pivot_table: ext.pivot_table.clone().ok_or_else(|| missing("pivot_table"))?,
                    foreign_key: ext.foreign_key.clone(),
                    related_key: ext.related_key.clone().ok_or_else(|| missing("related_key"))?,
                    local_key: ext.local_key.clone(),
                }
            }
        };

        push(Relation {
            name: ext.name.clone(),
            kind,
        })?;
    }

    Ok(relations)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn definition(yaml: &str) -> EntityDefinition {
        serde_yml::from_str(yaml).unwrap()
    }

    #[test]
    fn resolves_all_kinds() {
        let def = definition(
            r#"
name: comment
table: comments
fields:
  - key: author_id
    type: number
    relation: { name: author, entity: user }
  - key: commentable_id
    type: number
    relation: { name: commentable, polymorphic: true, morph_type: commentable_type }
external_relations:
  - { name: replies, entity: comment, kind: has_many, foreign_key: parent_id }
  - { name: tags, entity: tag, pivot_table: comment_tag, foreign_key: comment_id, related_key: tag_id }
"#,
        );

        let relations = resolve_relations(&def).unwrap();
        let names: Vec<&str> = relations.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["author", "commentable", "replies", "tags"]);

        assert_eq!(
            relations[0].kind,
            RelationKind::BelongsTo {
                related: "user".into(),
                foreign_key: "author_id".into(),
                owner_key: "id".into(),
            }
        );
        assert!(matches!(
            &relations[1].kind,
            RelationKind::MorphTo { type_column, .. } if type_column == "commentable_type"
        ));
        assert!(!relations[2].kind.is_singular());
        assert_eq!(relations[3].kind.related(), Some("tag"));
    }

    #[test]
    fn duplicate_relation_names_are_rejected() {
        let def = definition(
            r#"
name: order
table: orders
fields:
  - key: customer_id
    type: number
    relation: { name: customer, entity: customer }
external_relations:
  - { name: customer, entity: customer, kind: has_many, foreign_key: order_id }
"#,
        );
        let err = resolve_relations(&def).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateRelation { .. }));
    }

    #[test]
    fn belongs_to_many_needs_pivot() {
        let def = definition(
            r#"
name: order
table: orders
fields: []
external_relations:
  - { name: tags, entity: tag, foreign_key: order_id }
"#,
        );
        let err = resolve_relations(&def).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::IncompleteRelation { missing: "pivot_table", .. }
        ));
    }
}
