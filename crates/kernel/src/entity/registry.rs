//! Entity registry.
//!
//! Holds every entity definition together with its resolved relations and
//! the application-provided override hooks. Built once at startup through
//! [`EntityRegistryBuilder`], which rejects invalid metadata before any
//! request is served.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::ConfigurationError;
use super::overrides::{CustomRule, OrderOverride, SearchOverride};
use super::relation::{Relation, RelationKind, resolve_relations};
use super::types::{EntityDefinition, FieldDescriptor};
use crate::query::sql::is_safe_identifier;
use crate::query::{FieldPath, TemplateExpr, relation_path_for};

/// A registered entity: its definition, resolved relations and hooks.
pub struct Entity {
    definition: EntityDefinition,
    relations: Vec<Relation>,
    search_overrides: HashMap<String, Arc<dyn SearchOverride>>,
    order_overrides: HashMap<String, Arc<dyn OrderOverride>>,
}

impl Entity {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn table(&self) -> &str {
        &self.definition.table
    }

    pub fn definition(&self) -> &EntityDefinition {
        &self.definition
    }

    pub fn soft_deletes(&self) -> bool {
        self.definition.soft_deletes
    }

    /// Relations in declaration order (field relations first).
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn search_override(&self, key: &str) -> Option<&Arc<dyn SearchOverride>> {
        self.search_overrides.get(key)
    }

    pub fn order_override(&self, key: &str) -> Option<&Arc<dyn OrderOverride>> {
        self.order_overrides.get(key)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.definition.name)
            .field("table", &self.definition.table)
            .field("relations", &self.relations.len())
            .field("search_overrides", &self.search_overrides.len())
            .field("order_overrides", &self.order_overrides.len())
            .finish()
    }
}

/// One belongs-to hop, as needed to build a join or a correlated subquery.
#[derive(Debug, Clone, Copy)]
pub struct JoinHop<'a> {
    pub target: &'a Entity,
    pub foreign_key: &'a str,
    pub owner_key: &'a str,
}

/// Immutable set of entities, shared by every request.
pub struct EntityRegistry {
    entities: HashMap<String, Entity>,
    custom_rules: HashMap<String, Arc<dyn CustomRule>>,
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    /// Like [`get`](Self::get), for names coming from metadata.
    pub fn require(&self, name: &str) -> Result<&Entity, ConfigurationError> {
        self.entities
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownEntity(name.to_string()))
    }

    /// Entity names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn custom_rule(&self, name: &str) -> Option<&Arc<dyn CustomRule>> {
        self.custom_rules.get(name)
    }

    /// Follow a belongs-to relation of `entity`.
    pub fn belongs_to<'a>(
        &'a self,
        entity: &'a Entity,
        relation: &str,
    ) -> Result<JoinHop<'a>, ConfigurationError> {
        let rel = entity
            .relation(relation)
            .ok_or_else(|| ConfigurationError::UnknownRelation {
                entity: entity.name().to_string(),
                relation: relation.to_string(),
            })?;

        let RelationKind::BelongsTo {
            related,
            foreign_key,
            owner_key,
        } = &rel.kind
        else {
            return Err(ConfigurationError::UnjoinableRelation {
                entity: entity.name().to_string(),
                relation: relation.to_string(),
            });
        };

        Ok(JoinHop {
            target: self.require(related)?,
            foreign_key,
            owner_key,
        })
    }

    /// Walk a chain of belongs-to hops and return the entity at its end.
    pub fn walk<'a, S: AsRef<str>>(
        &'a self,
        from: &'a Entity,
        hops: &[S],
    ) -> Result<&'a Entity, ConfigurationError> {
        let mut entity = from;
        for hop in hops {
            entity = self.belongs_to(entity, hop.as_ref())?.target;
        }
        Ok(entity)
    }

    fn validate_links(&self, entity: &Entity) -> Result<(), ConfigurationError> {
        let def = entity.definition();

        for relation in entity.relations() {
            if let Some(related) = relation.kind.related() {
                self.require(related)?;
            }
        }

        for field in &def.fields {
            // Morph labels are rendered from loaded rows and never joined.
            if let Some(rel) = field.relation.as_ref().filter(|r| !r.polymorphic) {
                for template in [&rel.table_key, &rel.form_key].into_iter().flatten() {
                    if template.is_plain() {
                        let path = FieldPath::new(template.to_string());
                        for segment in path.segments() {
                            ensure_safe(&def.name, segment)?;
                        }
                        self.walk(entity, &relation_path_for(Some(&rel.name), &path))?;
                    } else {
                        self.validate_template(entity, Some(&rel.name), template)?;
                    }
                }
            }
            for key in [&field.search_key, &field.order_key].into_iter().flatten() {
                let template = TemplateExpr::parse(key);
                if template.is_plain() {
                    let path = FieldPath::new(key.as_str());
                    self.walk(entity, &path.relations())?;
                } else {
                    self.validate_template(entity, None, &template)?;
                }
            }
            for rule in &field.rules.custom {
                if !self.custom_rules.contains_key(rule) {
                    warn!(
                        entity = %def.name,
                        field = %field.key,
                        rule = %rule,
                        "field references an unregistered custom rule; it will be skipped"
                    );
                }
            }
        }

        for include in &def.includes {
            self.validate_include(entity, include)?;
        }

        if let Some(calendar) = &def.calendar {
            for (what, key) in [("calendar start", &calendar.start), ("calendar end", &calendar.end)] {
                let is_timestamp = def.timestamps && matches!(key.as_str(), "created_at" | "updated_at");
                if def.field(key).is_none() && !is_timestamp {
                    return Err(ConfigurationError::UnknownField {
                        entity: def.name.clone(),
                        what,
                        key: key.clone(),
                    });
                }
            }
            for path in calendar.title.paths() {
                let hops = path.relations();
                if let Some((last, init)) = hops.split_last() {
                    let owner = self.walk(entity, init)?;
                    if owner.relation(last).is_none() {
                        return Err(ConfigurationError::UnknownRelation {
                            entity: owner.name().to_string(),
                            relation: (*last).to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Template paths must be joinable chains from the entity (plus the
    /// relation scope, when the template belongs to a relation).
    fn validate_template(
        &self,
        entity: &Entity,
        scope: Option<&str>,
        template: &TemplateExpr,
    ) -> Result<(), ConfigurationError> {
        for path in template.paths() {
            let hops = relation_path_for(scope, path);
            self.walk(entity, &hops)?;
            ensure_safe(&entity.definition.name, path.column())?;
        }
        Ok(())
    }

    /// Include paths may traverse any relation kind; a polymorphic hop can
    /// only be the last one.
    fn validate_include(&self, entity: &Entity, include: &str) -> Result<(), ConfigurationError> {
        let hops: Vec<&str> = include.split('.').collect();
        let mut current = entity;
        for (i, hop) in hops.iter().enumerate() {
            let relation =
                current
                    .relation(hop)
                    .ok_or_else(|| ConfigurationError::UnknownRelation {
                        entity: current.name().to_string(),
                        relation: (*hop).to_string(),
                    })?;
            match relation.kind.related() {
                Some(related) => current = self.require(related)?,
                None if i + 1 == hops.len() => {}
                None => {
                    return Err(ConfigurationError::UnjoinableRelation {
                        entity: current.name().to_string(),
                        relation: (*hop).to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.names())
            .field("custom_rules", &self.custom_rules.len())
            .finish()
    }
}

type HookKey = (String, String);

/// Collects definitions and hooks, then validates them as a whole.
#[derive(Default)]
pub struct EntityRegistryBuilder {
    definitions: Vec<EntityDefinition>,
    search_overrides: Vec<(HookKey, Arc<dyn SearchOverride>)>,
    order_overrides: Vec<(HookKey, Arc<dyn OrderOverride>)>,
    custom_rules: HashMap<String, Arc<dyn CustomRule>>,
}

impl EntityRegistryBuilder {
    pub fn entity(mut self, definition: EntityDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn entities(mut self, definitions: impl IntoIterator<Item = EntityDefinition>) -> Self {
        self.definitions.extend(definitions);
        self
    }

    /// Replace search compilation for `entity.key`.
    pub fn search_override(
        mut self,
        entity: &str,
        key: &str,
        hook: impl SearchOverride + 'static,
    ) -> Self {
        self.search_overrides
            .push(((entity.to_string(), key.to_string()), Arc::new(hook)));
        self
    }

    /// Replace sort compilation for `entity.key`.
    pub fn order_override(
        mut self,
        entity: &str,
        key: &str,
        hook: impl OrderOverride + 'static,
    ) -> Self {
        self.order_overrides
            .push(((entity.to_string(), key.to_string()), Arc::new(hook)));
        self
    }

    /// Register a named validation rule for `rules.custom`.
    pub fn custom_rule(mut self, name: &str, rule: impl CustomRule + 'static) -> Self {
        self.custom_rules.insert(name.to_string(), Arc::new(rule));
        self
    }

    pub fn build(self) -> Result<EntityRegistry, ConfigurationError> {
        let mut entities: HashMap<String, Entity> = HashMap::new();

        for definition in self.definitions {
            validate_identifiers(&definition)?;
            let relations = resolve_relations(&definition)?;

            if entities.contains_key(&definition.name) {
                return Err(ConfigurationError::Load(format!(
                    "entity '{}' is declared twice",
                    definition.name
                )));
            }

            debug!(
                entity = %definition.name,
                table = %definition.table,
                relations = relations.len(),
                "entity registered"
            );

            entities.insert(
                definition.name.clone(),
                Entity {
                    definition,
                    relations,
                    search_overrides: HashMap::new(),
                    order_overrides: HashMap::new(),
                },
            );
        }

        for ((entity, key), hook) in self.search_overrides {
            entities
                .get_mut(&entity)
                .ok_or(ConfigurationError::UnknownEntity(entity))?
                .search_overrides
                .insert(key, hook);
        }

        for ((entity, key), hook) in self.order_overrides {
            entities
                .get_mut(&entity)
                .ok_or(ConfigurationError::UnknownEntity(entity))?
                .order_overrides
                .insert(key, hook);
        }

        let registry = EntityRegistry {
            entities,
            custom_rules: self.custom_rules,
        };

        for entity in registry.entities.values() {
            registry.validate_links(entity)?;
        }

        info!(entities = registry.len(), "entity registry built");
        Ok(registry)
    }
}

fn ensure_safe(entity: &str, identifier: &str) -> Result<(), ConfigurationError> {
    if is_safe_identifier(identifier) {
        Ok(())
    } else {
        Err(ConfigurationError::UnsafeIdentifier {
            entity: entity.to_string(),
            identifier: identifier.to_string(),
        })
    }
}

fn validate_field_identifiers(entity: &str, field: &FieldDescriptor) -> Result<(), ConfigurationError> {
    ensure_safe(entity, &field.key)?;

    if let Some(rel) = &field.relation {
        ensure_safe(entity, &rel.name)?;
        ensure_safe(entity, &rel.owner_key)?;
        if let Some(morph_type) = &rel.morph_type {
            ensure_safe(entity, morph_type)?;
        }
    }

    for key in [&field.search_key, &field.order_key].into_iter().flatten() {
        let template = TemplateExpr::parse(key);
        if template.is_plain() {
            for segment in key.split('.') {
                ensure_safe(entity, segment)?;
            }
        }
    }

    if let Some(combo) = &field.combo_field {
        ensure_safe(entity, combo)?;
    }

    Ok(())
}

/// Every name that can reach SQL text must be a plain identifier, and field
/// keys must be unique.
fn validate_identifiers(def: &EntityDefinition) -> Result<(), ConfigurationError> {
    let entity = def.name.as_str();
    ensure_safe(entity, entity)?;
    ensure_safe(entity, &def.table)?;

    let mut seen: Vec<&str> = Vec::new();
    for field in &def.fields {
        if seen.contains(&field.key.as_str()) {
            return Err(ConfigurationError::DuplicateField {
                entity: entity.to_string(),
                key: field.key.clone(),
            });
        }
        seen.push(&field.key);
        validate_field_identifiers(entity, field)?;
    }

    for ext in &def.external_relations {
        ensure_safe(entity, &ext.name)?;
        ensure_safe(entity, &ext.foreign_key)?;
        ensure_safe(entity, &ext.local_key)?;
        for name in [&ext.pivot_table, &ext.related_key].into_iter().flatten() {
            ensure_safe(entity, name)?;
        }
        for field in &ext.pivot_fields {
            validate_field_identifiers(entity, field)?;
        }
    }

    if let Some(calendar) = &def.calendar {
        ensure_safe(entity, &calendar.start)?;
        ensure_safe(entity, &calendar.end)?;
        for path in calendar.title.paths() {
            for segment in path.segments() {
                ensure_safe(entity, segment)?;
            }
        }
    }

    Ok(())
}

/// Read every `*.yaml` / `*.yml` file of a directory, in file name order.
pub fn load_definitions(dir: &Path) -> Result<Vec<EntityDefinition>, ConfigurationError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ConfigurationError::Load(format!("{}: {e}", dir.display())))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml" | "yml")
            )
        })
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| ConfigurationError::Load(format!("{}: {e}", path.display())))?;
            serde_yml::from_str(&raw)
                .map_err(|e| ConfigurationError::Load(format!("{}: {e}", path.display())))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::{definitions, extended_registry, shop_registry};

    #[test]
    fn builds_fixture_registry() {
        let registry = shop_registry();
        assert_eq!(
            registry.names(),
            ["address", "country", "customer", "order", "order_line", "tag"]
        );
        let order = registry.get("order").unwrap();
        assert!(order.soft_deletes());
        assert!(order.relation("customer").is_some());
        assert!(order.relation("tags").is_some());
    }

    #[test]
    fn walks_belongs_to_chain() {
        let registry = shop_registry();
        let order = registry.get("order").unwrap();
        let country = registry.walk(order, &["customer", "address", "country"]).unwrap();
        assert_eq!(country.table(), "countries");
    }

    #[test]
    fn has_many_is_not_joinable() {
        let registry = shop_registry();
        let order = registry.get("order").unwrap();
        let err = registry.belongs_to(order, "lines").unwrap_err();
        assert!(matches!(err, ConfigurationError::UnjoinableRelation { .. }));
    }

    #[test]
    fn unknown_relation_in_template_fails_build() {
        let mut defs = definitions();
        for def in &mut defs {
            if def.name == "order" {
                let field = def.fields.iter_mut().find(|f| f.key == "customer_id").unwrap();
                let rel = field.relation.as_mut().unwrap();
                rel.table_key = Some(TemplateExpr::parse("{first_name} {nope.name}"));
            }
        }
        let err = EntityRegistry::builder().entities(defs).build().unwrap_err();
        assert!(
            matches!(&err, ConfigurationError::UnknownRelation { relation, .. } if relation == "nope"),
            "{err}"
        );
    }

    #[test]
    fn polymorphic_label_keys_are_not_joined() {
        let registry = extended_registry();
        let comment = registry.get("comment").unwrap();
        assert!(matches!(
            comment.relation("commentable").unwrap().kind,
            RelationKind::MorphTo { ref type_column, .. } if type_column == "commentable_type"
        ));
    }

    #[test]
    fn unknown_related_entity_fails_build() {
        let mut defs = definitions();
        defs.retain(|d| d.name != "country");
        let err = EntityRegistry::builder().entities(defs).build().unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownEntity(name) if name == "country"));
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        let mut defs = definitions();
        defs[0].table = "countries; drop table x".to_string();
        let err = EntityRegistry::builder().entities(defs).build().unwrap_err();
        assert!(matches!(err, ConfigurationError::UnsafeIdentifier { .. }));
    }

    #[test]
    fn duplicate_field_keys_are_rejected() {
        let mut defs = definitions();
        let copy = defs[0].fields[0].clone();
        defs[0].fields.push(copy);
        let err = EntityRegistry::builder().entities(defs).build().unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateField { .. }));
    }

    #[test]
    fn override_for_unknown_entity_fails_build() {
        struct Noop;
        impl SearchOverride for Noop {
            fn apply(
                &self,
                _ctx: &mut crate::query::QueryContext<'_>,
                _term: &str,
            ) -> Result<(), ConfigurationError> {
                Ok(())
            }
        }

        let err = EntityRegistry::builder()
            .entities(definitions())
            .search_override("ghost", "name", Noop)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownEntity(name) if name == "ghost"));
    }

    #[test]
    fn loads_yaml_directory() {
        let dir = std::env::temp_dir().join(format!("autocrud-entities-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("tag.yaml"),
            autocrud_test_utils::fixtures::TAG,
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let defs = load_definitions(&dir).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "tag");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
