//! Single-row operations: read, create, update, delete, restore, export
//! and pivot maintenance.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use tracing::{debug, info};

use super::audit::{self, AuditAction};
use super::custom_fields::CustomFieldService;
use super::payload::{FormPayload, scalar_text};
use super::validation::{UniqueChecker, ValidationErrors, Validator};
use super::write::{
    ColumnValue, Columns, PivotLink, all_sql, delete_sql, find_sql, form_columns, insert_sql,
    paths_value, pivot_columns, stored_paths, update_sql,
};
use crate::entity::{
    Entity, EntityRegistry, ExternalRelationRef, FieldDescriptor, RelationKind, casts,
};
use crate::error::{AppError, AppResult};
use crate::file::{FileLocation, FileService};
use crate::query::{EagerLoader, TrashScope};

/// Body returned by mutating operations.
#[derive(Debug, Clone, Serialize)]
pub struct MutationResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MutationResponse {
    fn new(message: &str, data: Option<Value>) -> Self {
        Self {
            message: message.to_string(),
            data,
        }
    }
}

/// Row-level operations over metadata-described entities.
#[derive(Clone)]
pub struct CrudService {
    pool: PgPool,
    registry: Arc<EntityRegistry>,
    files: Arc<FileService>,
    custom_fields: Arc<CustomFieldService>,
    unique: Arc<dyn UniqueChecker>,
}

impl CrudService {
    pub fn new(
        pool: PgPool,
        registry: Arc<EntityRegistry>,
        files: Arc<FileService>,
        custom_fields: Arc<CustomFieldService>,
        unique: Arc<dyn UniqueChecker>,
    ) -> Self {
        Self {
            pool,
            registry,
            files,
            custom_fields,
            unique,
        }
    }

    async fn find(&self, entity: &Entity, id: &str, scope: TrashScope) -> AppResult<Value> {
        let sql = find_sql(entity, id, scope);
        sqlx::query_scalar::<_, Value>(&sql)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Attach relations and custom values to a raw row and shape it.
    async fn present(&self, entity: &Entity, row: Value, id: &str) -> AppResult<Value> {
        let mut rows = [row];
        EagerLoader::new(&self.pool, &self.registry)
            .load(entity, &mut rows)
            .await?;
        let [mut row] = rows;
        casts::shape_row(entity.definition(), &mut row);

        if entity.definition().custom_fields_enabled {
            let values = self.custom_fields.values_for(entity.name(), id).await?;
            if let Value::Object(map) = &mut row {
                map.extend(values);
            }
        }
        Ok(row)
    }

    /// One active row with its relations and custom values.
    pub async fn get_item(&self, entity: &Entity, id: &str) -> AppResult<Value> {
        let row = self.find(entity, id, TrashScope::Active).await?;
        self.present(entity, row, id).await
    }

    async fn custom_descriptors(&self, entity: &Entity) -> AppResult<Vec<FieldDescriptor>> {
        if !entity.definition().custom_fields_enabled {
            return Ok(Vec::new());
        }
        Ok(self
            .custom_fields
            .active(entity.name())
            .await?
            .iter()
            .map(|d| d.to_field_descriptor())
            .collect())
    }

    async fn validate(
        &self,
        entity: &Entity,
        payload: &FormPayload,
        id: Option<&str>,
    ) -> AppResult<()> {
        let validator = Validator::new(&self.registry, self.unique.as_ref());
        let mut errors = validator.validate_form(entity, payload, id).await?;
        let extra = self.custom_descriptors(entity).await?;
        if !extra.is_empty() {
            errors.merge(validator.validate_extra(entity, &extra, payload, id).await?);
        }
        errors.into_result()?;
        Ok(())
    }

    async fn save_custom_values(
        &self,
        entity: &Entity,
        id: &str,
        payload: &FormPayload,
    ) -> AppResult<()> {
        if entity.definition().custom_fields_enabled {
            self.custom_fields
                .save_values(entity.name(), id, payload)
                .await?;
        }
        Ok(())
    }

    /// Validate and insert a row, then store its uploads.
    pub async fn create(
        &self,
        entity: &Entity,
        payload: &FormPayload,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        self.validate(entity, payload, None).await?;

        let mut columns = form_columns(entity.definition(), payload)?;
        if entity.definition().timestamps {
            columns.push(("created_at".into(), ColumnValue::Now));
            columns.push(("updated_at".into(), ColumnValue::Now));
        }
        let sql = insert_sql(entity.table(), columns)?;
        let id: String = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;

        let mut uploads = Columns::new();
        for field in entity.definition().editable_fields() {
            let Some(location) = FileLocation::for_field(entity.name(), &field) else {
                continue;
            };
            let files = payload.files(&field.key);
            if files.is_empty() {
                continue;
            }
            let value = if field.multiple {
                let paths = self
                    .files
                    .store_multiple(&location, &id, Vec::new(), files)
                    .await?;
                paths_value(&paths)?
            } else {
                ColumnValue::Text(self.files.store_single(&location, &id, &files[0]).await?)
            };
            uploads.push((field.key.clone(), value));
        }
        if let Some(sql) = update_sql(entity.table(), &id, uploads) {
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        self.save_custom_values(entity, &id, payload).await?;
        audit::record(&self.pool, actor, entity.name(), &id, AuditAction::Create).await?;
        info!(entity = %entity.name(), id = %id, "item created");

        let row = self.find(entity, &id, TrashScope::WithTrashed).await?;
        let data = self.present(entity, row, &id).await?;
        Ok(MutationResponse::new("Item created.", Some(data)))
    }

    /// Validate and update an active row, applying upload edits.
    pub async fn update(
        &self,
        entity: &Entity,
        id: &str,
        payload: &FormPayload,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        let current = self.find(entity, id, TrashScope::Active).await?;
        self.validate(entity, payload, Some(id)).await?;

        let mut columns = Columns::new();
        for field in entity.definition().editable_fields() {
            let Some(location) = FileLocation::for_field(entity.name(), &field) else {
                continue;
            };
            if let Some(value) = self
                .apply_upload_edits(&location, &field, id, &current, payload)
                .await?
            {
                columns.push((field.key.clone(), value));
            }
        }
        columns.extend(form_columns(entity.definition(), payload)?);
        if entity.definition().timestamps {
            columns.push(("updated_at".into(), ColumnValue::Now));
        }
        if let Some(sql) = update_sql(entity.table(), id, columns) {
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        self.save_custom_values(entity, id, payload).await?;
        audit::record(&self.pool, actor, entity.name(), id, AuditAction::Update).await?;
        info!(entity = %entity.name(), id = %id, "item updated");

        let row = self.find(entity, id, TrashScope::WithTrashed).await?;
        let data = self.present(entity, row, id).await?;
        Ok(MutationResponse::new("Item updated.", Some(data)))
    }

    /// New column value of an upload field, or `None` when untouched.
    ///
    /// Multi-file fields drop the paths listed in `<field>_delete` before
    /// appending new uploads. Single-file fields are cleared by
    /// `<field>_edited` and replaced by a new upload.
    async fn apply_upload_edits(
        &self,
        location: &FileLocation,
        field: &FieldDescriptor,
        id: &str,
        current: &Value,
        payload: &FormPayload,
    ) -> AppResult<Option<ColumnValue>> {
        let files = payload.files(&field.key);

        if field.multiple {
            let mut paths = stored_paths(current.get(&field.key));
            let removals = payload.string_list(&format!("{}_delete", field.key));
            let before = paths.len();
            for path in removals {
                // Only paths owned by this row may be removed.
                if let Some(index) = paths.iter().position(|p| *p == path) {
                    self.files.delete(&path).await;
                    paths.remove(index);
                }
            }
            if files.is_empty() && paths.len() == before {
                return Ok(None);
            }
            let paths = self.files.store_multiple(location, id, paths, files).await?;
            return Ok(Some(paths_value(&paths)?));
        }

        let mut value = None;
        if payload.flag(&format!("{}_edited", field.key)) {
            let path = current
                .get(&field.key)
                .and_then(scalar_text)
                .unwrap_or_else(|| location.single(id));
            self.files.delete(&path).await;
            value = Some(ColumnValue::Null);
        }
        if let Some(upload) = files.first() {
            let path = self.files.store_single(location, id, upload).await?;
            value = Some(ColumnValue::Text(path));
        }
        Ok(value)
    }

    async fn delete_uploads(&self, entity: &Entity, row: &Value) {
        for field in entity.definition().fields.iter().filter(|f| f.field_type.is_upload()) {
            let paths = if field.multiple {
                stored_paths(row.get(&field.key))
            } else {
                row.get(&field.key).and_then(scalar_text).into_iter().collect()
            };
            for path in paths {
                self.files.delete(&path).await;
            }
        }
    }

    async fn remove_row(&self, entity: &Entity, id: &str, row: &Value) -> AppResult<()> {
        sqlx::query(&delete_sql(entity.table(), id))
            .execute(&self.pool)
            .await?;
        self.delete_uploads(entity, row).await;
        if entity.definition().custom_fields_enabled {
            self.custom_fields.delete_values(entity.name(), id).await?;
        }
        Ok(())
    }

    /// Move an active row to the trash, or delete it when the entity does
    /// not soft-delete.
    pub async fn destroy(
        &self,
        entity: &Entity,
        id: &str,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        let row = self.find(entity, id, TrashScope::Active).await?;

        let message = if entity.soft_deletes() {
            let sql = update_sql(
                entity.table(),
                id,
                vec![("deleted_at".into(), ColumnValue::Now)],
            )
            .context("soft delete sets deleted_at")?;
            sqlx::query(&sql).execute(&self.pool).await?;
            "Item moved to trash."
        } else {
            self.remove_row(entity, id, &row).await?;
            "Item deleted."
        };

        audit::record(&self.pool, actor, entity.name(), id, AuditAction::Destroy).await?;
        info!(entity = %entity.name(), id = %id, soft = entity.soft_deletes(), "item destroyed");
        Ok(MutationResponse::new(message, None))
    }

    /// Delete a trashed row for good, with its uploads and custom values.
    ///
    /// Entities without soft deletes have no trash, so any row qualifies.
    pub async fn destroy_permanent(
        &self,
        entity: &Entity,
        id: &str,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        let scope = if entity.soft_deletes() {
            TrashScope::OnlyTrashed
        } else {
            TrashScope::WithTrashed
        };
        let row = self.find(entity, id, scope).await?;
        self.remove_row(entity, id, &row).await?;

        audit::record(&self.pool, actor, entity.name(), id, AuditAction::DestroyPermanent).await?;
        info!(entity = %entity.name(), id = %id, "item permanently deleted");
        Ok(MutationResponse::new("Item permanently deleted.", None))
    }

    /// Bring a trashed row back.
    pub async fn restore(
        &self,
        entity: &Entity,
        id: &str,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        if !entity.soft_deletes() {
            return Err(AppError::NotFound);
        }
        self.find(entity, id, TrashScope::OnlyTrashed).await?;

        let sql = update_sql(
            entity.table(),
            id,
            vec![("deleted_at".into(), ColumnValue::Null)],
        )
        .context("restore clears deleted_at")?;
        sqlx::query(&sql).execute(&self.pool).await?;

        audit::record(&self.pool, actor, entity.name(), id, AuditAction::Restore).await?;
        info!(entity = %entity.name(), id = %id, "item restored");
        Ok(MutationResponse::new("Item restored.", None))
    }

    /// Every active row, shaped, as `{itemsExcel: [...]}`.
    pub async fn export(&self, entity: &Entity) -> AppResult<Value> {
        let sql = all_sql(entity, TrashScope::Active);
        let mut rows: Vec<Value> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        EagerLoader::new(&self.pool, &self.registry)
            .load(entity, &mut rows)
            .await?;
        casts::shape_rows(entity.definition(), &mut rows);
        debug!(entity = %entity.name(), count = rows.len(), "export built");
        Ok(json!({ "itemsExcel": rows }))
    }

    /// Resolve a belongs-to-many relation and the owner's local key value.
    fn pivot_target<'e>(
        &self,
        entity: &'e Entity,
        relation: &str,
        owner: &Value,
        id: &str,
    ) -> AppResult<(&'e ExternalRelationRef, String)> {
        let is_pivot = matches!(
            entity.relation(relation).map(|r| &r.kind),
            Some(RelationKind::BelongsToMany { .. })
        );
        let external = entity
            .definition()
            .external_relation(relation)
            .filter(|_| is_pivot)
            .ok_or(AppError::NotFound)?;
        let owner_key = owner
            .get(&external.local_key)
            .and_then(scalar_text)
            .unwrap_or_else(|| id.to_string());
        Ok((external, owner_key))
    }

    async fn change_pivot(
        &self,
        entity: &Entity,
        id: &str,
        request: PivotRequest<'_>,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        let PivotRequest {
            relation,
            item,
            payload,
            change,
        } = request;
        let owner = self.find(entity, id, TrashScope::Active).await?;
        let (external, owner_key) = self.pivot_target(entity, relation, &owner, id)?;
        let (Some(table), Some(related_key)) = (&external.pivot_table, &external.related_key)
        else {
            return Err(AppError::NotFound);
        };
        let link = PivotLink {
            table,
            foreign_key: &external.foreign_key,
            owner: &owner_key,
            related_key,
            item,
        };

        let columns = match payload {
            Some(payload) => {
                let validator = Validator::new(&self.registry, self.unique.as_ref());
                let errors: ValidationErrors = validator
                    .validate_pivot(external, payload, &owner_key, item)
                    .await?;
                errors.into_result()?;
                pivot_columns(&external.pivot_fields, payload)?
            }
            None => Columns::new(),
        };

        let sql = match change {
            PivotChange::Bind => Some(link.insert_sql(columns)?),
            PivotChange::Update => link.update_sql(columns),
            PivotChange::Unbind => Some(link.delete_sql()),
        };
        if let Some(sql) = sql {
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        audit::record(&self.pool, actor, entity.name(), id, AuditAction::Update).await?;
        info!(
            entity = %entity.name(),
            id = %id,
            relation = %relation,
            item = %item,
            change = change.as_str(),
            "pivot changed"
        );

        let data = self.present(entity, owner, id).await?;
        Ok(MutationResponse::new(change.message(), Some(data)))
    }

    /// Link `item` to row `id` through a belongs-to-many relation.
    pub async fn bind(
        &self,
        entity: &Entity,
        id: &str,
        relation: &str,
        item: &str,
        payload: &FormPayload,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        let request = PivotRequest {
            relation,
            item,
            payload: Some(payload),
            change: PivotChange::Bind,
        };
        self.change_pivot(entity, id, request, actor).await
    }

    /// Rewrite the pivot columns of an existing link.
    pub async fn update_pivot(
        &self,
        entity: &Entity,
        id: &str,
        relation: &str,
        item: &str,
        payload: &FormPayload,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        let request = PivotRequest {
            relation,
            item,
            payload: Some(payload),
            change: PivotChange::Update,
        };
        self.change_pivot(entity, id, request, actor).await
    }

    pub async fn unbind(
        &self,
        entity: &Entity,
        id: &str,
        relation: &str,
        item: &str,
        actor: Option<&str>,
    ) -> AppResult<MutationResponse> {
        let request = PivotRequest {
            relation,
            item,
            payload: None,
            change: PivotChange::Unbind,
        };
        self.change_pivot(entity, id, request, actor).await
    }
}

struct PivotRequest<'a> {
    relation: &'a str,
    item: &'a str,
    payload: Option<&'a FormPayload>,
    change: PivotChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PivotChange {
    Bind,
    Update,
    Unbind,
}

impl PivotChange {
    fn as_str(self) -> &'static str {
        match self {
            PivotChange::Bind => "bind",
            PivotChange::Update => "update",
            PivotChange::Unbind => "unbind",
        }
    }

    fn message(self) -> &'static str {
        match self {
            PivotChange::Bind => "Item linked.",
            PivotChange::Update => "Link updated.",
            PivotChange::Unbind => "Item unlinked.",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn mutation_response_omits_missing_data() {
        let body = serde_json::to_value(MutationResponse::new("Item restored.", None)).unwrap();
        assert_eq!(body, json!({"message": "Item restored."}));

        let body =
            serde_json::to_value(MutationResponse::new("Item created.", Some(json!({"id": 1}))))
                .unwrap();
        assert_eq!(body["data"]["id"], 1);
    }

    #[test]
    fn pivot_change_messages() {
        assert_eq!(PivotChange::Bind.message(), "Item linked.");
        assert_eq!(PivotChange::Unbind.as_str(), "unbind");
    }
}
