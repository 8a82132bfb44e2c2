//! Runtime-defined fields stored as entity-attribute-value rows.
//!
//! Definitions live in `custom_field_definitions` (one set per entity) and
//! values in `custom_field_values`, keyed by `(definition, entity, row id)`.
//! In payloads and responses a value appears as `custom_<name>`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sqlx::PgPool;
use tracing::{debug, info};

use super::payload::{FormPayload, is_blank, scalar_text};
use super::validation::ValidationErrors;
use crate::entity::{FieldDescriptor, FieldRules, FieldType};
use crate::error::{AppError, AppResult};
use crate::query::listing::as_flag;

/// Prefix of custom values in payloads and responses.
pub const CUSTOM_PREFIX: &str = "custom_";

/// Value type of a custom field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomFieldType {
    String,
    Number,
    Text,
    Boolean,
    Date,
    Datetime,
    Select,
}

impl CustomFieldType {
    pub const ALL: [CustomFieldType; 7] = [
        CustomFieldType::String,
        CustomFieldType::Number,
        CustomFieldType::Text,
        CustomFieldType::Boolean,
        CustomFieldType::Date,
        CustomFieldType::Datetime,
        CustomFieldType::Select,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CustomFieldType::String => "string",
            CustomFieldType::Number => "number",
            CustomFieldType::Text => "text",
            CustomFieldType::Boolean => "boolean",
            CustomFieldType::Date => "date",
            CustomFieldType::Datetime => "datetime",
            CustomFieldType::Select => "select",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    fn label(self) -> &'static str {
        match self {
            CustomFieldType::String => "Short text",
            CustomFieldType::Number => "Number",
            CustomFieldType::Text => "Long text",
            CustomFieldType::Boolean => "Yes/No",
            CustomFieldType::Date => "Date",
            CustomFieldType::Datetime => "Date and time",
            CustomFieldType::Select => "Selection",
        }
    }

    /// Regular field type used for validation and display.
    fn field_type(self) -> FieldType {
        match self {
            CustomFieldType::String => FieldType::String,
            CustomFieldType::Number => FieldType::Decimal,
            CustomFieldType::Text => FieldType::Text,
            CustomFieldType::Boolean => FieldType::Boolean,
            CustomFieldType::Date => FieldType::Date,
            CustomFieldType::Datetime => FieldType::Datetime,
            CustomFieldType::Select => FieldType::Select,
        }
    }
}

impl TryFrom<String> for CustomFieldType {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("unknown custom field type '{raw}'"))
    }
}

/// `{value, label}` pairs for the type picker.
pub fn available_types() -> Value {
    Value::Array(
        CustomFieldType::ALL
            .iter()
            .map(|t| json!({ "value": t.as_str(), "label": t.label() }))
            .collect(),
    )
}

/// One custom field of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CustomFieldDefinition {
    pub id: i64,
    pub model_type: String,
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type", try_from = "String")]
    pub field_type: CustomFieldType,
    pub options: Option<Value>,
    pub rules: Option<Value>,
    pub order: i32,
    pub is_active: bool,
    pub show_in_table: bool,
}

impl CustomFieldDefinition {
    /// Payload/response key.
    pub fn key(&self) -> String {
        format!("{CUSTOM_PREFIX}{}", self.name)
    }

    fn option_list(&self) -> Vec<String> {
        match &self.options {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
            _ => Vec::new(),
        }
    }

    /// The field as a regular descriptor, for validation.
    pub fn to_field_descriptor(&self) -> FieldDescriptor {
        let rules: FieldRules = self
            .rules
            .clone()
            .and_then(|r| serde_json::from_value(r).ok())
            .unwrap_or_default();
        FieldDescriptor {
            key: self.key(),
            label: self.label.clone(),
            field_type: self.field_type.field_type(),
            table: self.show_in_table,
            form: true,
            relation: None,
            search_key: None,
            order_key: None,
            rules: FieldRules {
                unique: false,
                ..rules
            },
            options: self.option_list(),
            multiple: false,
            public: false,
            hidden: false,
            combo_field: None,
        }
    }

    /// Form field entry for the model description.
    pub fn to_form_field(&self) -> Value {
        let mut field = json!({
            "key": self.key(),
            "label": self.label,
            "type": self.field_type.as_str(),
            "table": self.show_in_table,
            "form": true,
            "rules": self.rules.clone().unwrap_or_else(|| json!({})),
            "custom_field": true,
            "custom_field_id": self.id,
        });
        let options = self.option_list();
        if self.field_type == CustomFieldType::Select && !options.is_empty() {
            field["options"] = json!(options);
        }
        field
    }

    /// Stored text for a submitted value; `None` clears it.
    pub fn storage_value(&self, value: &Value) -> Option<String> {
        if is_blank(value) {
            return None;
        }
        match self.field_type {
            CustomFieldType::Boolean => Some(if as_flag(value) { "1" } else { "0" }.to_string()),
            _ => scalar_text(value),
        }
    }

    /// Typed value read back from storage.
    pub fn cast(&self, stored: Option<&str>) -> Value {
        let Some(raw) = stored else {
            return Value::Null;
        };
        match self.field_type {
            CustomFieldType::Number => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CustomFieldType::Boolean => Value::Bool(raw == "1"),
            _ => Value::String(raw.to_string()),
        }
    }
}

/// Fields accepted when creating or updating a definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomFieldInput {
    pub label: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub field_type: Option<String>,
    pub options: Option<Vec<String>>,
    pub rules: Option<Value>,
    pub order: Option<i32>,
    pub is_active: Option<bool>,
    pub show_in_table: Option<bool>,
}

impl CustomFieldInput {
    /// `creating` makes `label` and `type` mandatory.
    pub fn validate(&self, creating: bool) -> Result<Option<CustomFieldType>, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        match self.label.as_deref().map(str::trim) {
            None | Some("") if creating => errors.add("label", "The label field is required."),
            Some("") => errors.add("label", "The label field is required."),
            Some(label) if label.chars().count() > 255 => errors.add(
                "label",
                "The label field must not be greater than 255 characters.",
            ),
            _ => {}
        }
        if let Some(name) = &self.name {
            if name.chars().count() > 255 {
                errors.add("name", "The name field must not be greater than 255 characters.");
            }
        }

        let field_type = match self.field_type.as_deref() {
            None if creating => {
                errors.add("type", "The type field is required.");
                None
            }
            None => None,
            Some(raw) => {
                let parsed = CustomFieldType::parse(raw);
                if parsed.is_none() {
                    errors.add("type", "The selected type is invalid.");
                }
                parsed
            }
        };

        errors.into_result().map(|()| field_type)
    }
}

/// `Order Notes` becomes `order_notes`.
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

/// Name made unique among `taken` names sharing its prefix.
pub fn unique_name(base: &str, taken: usize) -> String {
    if taken == 0 {
        base.to_string()
    } else {
        format!("{base}_{}", taken + 1)
    }
}

const DEFINITION_COLUMNS: &str =
    r#"id, model_type, name, label, "type", options, rules, "order", is_active, show_in_table"#;

/// Definition management and value storage.
pub struct CustomFieldService {
    pool: PgPool,
}

impl CustomFieldService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Every definition of an entity, in display order.
    pub async fn list(&self, model: &str) -> AppResult<Vec<CustomFieldDefinition>> {
        let rows = sqlx::query_as(&format!(
            r#"SELECT {DEFINITION_COLUMNS} FROM custom_field_definitions
               WHERE model_type = $1 ORDER BY "order", id"#
        ))
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active definitions, in display order.
    pub async fn active(&self, model: &str) -> AppResult<Vec<CustomFieldDefinition>> {
        let rows = sqlx::query_as(&format!(
            r#"SELECT {DEFINITION_COLUMNS} FROM custom_field_definitions
               WHERE model_type = $1 AND is_active ORDER BY "order", id"#
        ))
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn create(
        &self,
        model: &str,
        input: CustomFieldInput,
    ) -> AppResult<CustomFieldDefinition> {
        let field_type = input
            .validate(true)?
            .ok_or_else(|| AppError::BadRequest("type is required".into()))?;
        let label = input.label.unwrap_or_default().trim().to_string();

        let base = match input.name.as_deref().map(slugify) {
            Some(name) if !name.is_empty() => name,
            _ => slugify(&label),
        };
        if base.is_empty() {
            let mut errors = ValidationErrors::default();
            errors.add("name", "The name must contain letters or digits.");
            return Err(errors.into());
        }

        let taken: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM custom_field_definitions WHERE model_type = $1 AND name LIKE $2",
        )
        .bind(model)
        .bind(format!("{base}%"))
        .fetch_one(&self.pool)
        .await?;
        let name = unique_name(&base, taken.max(0) as usize);

        let order = match input.order {
            Some(order) => order,
            None => {
                let max: Option<i32> = sqlx::query_scalar(
                    r#"SELECT MAX("order") FROM custom_field_definitions WHERE model_type = $1"#,
                )
                .bind(model)
                .fetch_one(&self.pool)
                .await?;
                max.map_or(0, |m| m + 1)
            }
        };

        let definition: CustomFieldDefinition = sqlx::query_as(&format!(
            r#"INSERT INTO custom_field_definitions
                 (model_type, name, label, "type", options, rules, "order", is_active, show_in_table)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING {DEFINITION_COLUMNS}"#
        ))
        .bind(model)
        .bind(&name)
        .bind(&label)
        .bind(field_type.as_str())
        .bind(input.options.map(|o| json!(o)))
        .bind(input.rules)
        .bind(order)
        .bind(input.is_active.unwrap_or(true))
        .bind(input.show_in_table.unwrap_or(false))
        .fetch_one(&self.pool)
        .await?;

        info!(model = %model, name = %definition.name, "custom field created");
        Ok(definition)
    }

    pub async fn update(
        &self,
        model: &str,
        id: i64,
        input: CustomFieldInput,
    ) -> AppResult<CustomFieldDefinition> {
        let field_type = input.validate(false)?;

        let definition: Option<CustomFieldDefinition> = sqlx::query_as(&format!(
            r#"UPDATE custom_field_definitions SET
                 label = COALESCE($3, label),
                 "type" = COALESCE($4, "type"),
                 options = COALESCE($5, options),
                 rules = COALESCE($6, rules),
                 "order" = COALESCE($7, "order"),
                 is_active = COALESCE($8, is_active),
                 show_in_table = COALESCE($9, show_in_table),
                 updated_at = NOW()
               WHERE model_type = $1 AND id = $2
               RETURNING {DEFINITION_COLUMNS}"#
        ))
        .bind(model)
        .bind(id)
        .bind(input.label.map(|l| l.trim().to_string()))
        .bind(field_type.map(CustomFieldType::as_str))
        .bind(input.options.map(|o| json!(o)))
        .bind(input.rules)
        .bind(input.order)
        .bind(input.is_active)
        .bind(input.show_in_table)
        .fetch_optional(&self.pool)
        .await?;

        let definition = definition.ok_or(AppError::NotFound)?;
        info!(model = %model, name = %definition.name, "custom field updated");
        Ok(definition)
    }

    /// Delete a definition; its values go with it.
    pub async fn delete(&self, model: &str, id: i64) -> AppResult<()> {
        let result =
            sqlx::query("DELETE FROM custom_field_definitions WHERE model_type = $1 AND id = $2")
                .bind(model)
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        info!(model = %model, id, "custom field deleted");
        Ok(())
    }

    /// Set `order` to each id's position in `ids`.
    pub async fn reorder(&self, model: &str, ids: &[i64]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        for (position, id) in ids.iter().enumerate() {
            let result = sqlx::query(
                r#"UPDATE custom_field_definitions SET "order" = $3, updated_at = NOW()
                   WHERE model_type = $1 AND id = $2"#,
            )
            .bind(model)
            .bind(id)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                let mut errors = ValidationErrors::default();
                errors.add("order", format!("The custom field {id} does not exist."));
                return Err(errors.into());
            }
        }
        tx.commit().await?;
        debug!(model = %model, count = ids.len(), "custom fields reordered");
        Ok(())
    }

    /// `custom_<name>` values of one row, cast by type.
    pub async fn values_for(&self, model: &str, id: &str) -> AppResult<Map<String, Value>> {
        let definitions = self.active(model).await?;
        let stored: Vec<(i64, Option<String>)> = sqlx::query_as(
            "SELECT custom_field_definition_id, value FROM custom_field_values
             WHERE model_type = $1 AND model_id = $2",
        )
        .bind(model)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut values = Map::new();
        for definition in &definitions {
            if let Some((_, raw)) = stored.iter().find(|(def_id, _)| *def_id == definition.id) {
                values.insert(definition.key(), definition.cast(raw.as_deref()));
            }
        }
        Ok(values)
    }

    /// Upsert every submitted `custom_<name>` value of row `id`.
    pub async fn save_values(
        &self,
        model: &str,
        id: &str,
        payload: &FormPayload,
    ) -> anyhow::Result<()> {
        let definitions = self
            .active(model)
            .await
            .context("failed to load custom fields")?;

        for definition in definitions {
            let Some(value) = payload.get(&definition.key()) else {
                continue;
            };
            sqlx::query(
                r#"INSERT INTO custom_field_values
                     (custom_field_definition_id, model_type, model_id, value, created_at, updated_at)
                   VALUES ($1, $2, $3, $4, NOW(), NOW())
                   ON CONFLICT (custom_field_definition_id, model_type, model_id)
                   DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()"#,
            )
            .bind(definition.id)
            .bind(model)
            .bind(id)
            .bind(definition.storage_value(value))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to store custom field {}", definition.name))?;
        }
        Ok(())
    }

    /// Drop the values of a permanently deleted row.
    pub async fn delete_values(&self, model: &str, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM custom_field_values WHERE model_type = $1 AND model_id = $2")
            .bind(model)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete custom field values")?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn definition(field_type: CustomFieldType) -> CustomFieldDefinition {
        CustomFieldDefinition {
            id: 3,
            model_type: "order".into(),
            name: "gift_wrap".into(),
            label: "Gift wrap".into(),
            field_type,
            options: None,
            rules: Some(json!({"required": true, "unique": true})),
            order: 0,
            is_active: true,
            show_in_table: true,
        }
    }

    #[test]
    fn slugs_and_unique_names() {
        assert_eq!(slugify("Order Notes"), "order_notes");
        assert_eq!(slugify("  VAT (%) rate "), "vat_rate");
        assert_eq!(slugify("!!!"), "");
        assert_eq!(unique_name("notes", 0), "notes");
        assert_eq!(unique_name("notes", 2), "notes_3");
    }

    #[test]
    fn types_parse_and_list() {
        assert_eq!(CustomFieldType::parse("datetime"), Some(CustomFieldType::Datetime));
        assert_eq!(CustomFieldType::parse("image"), None);
        assert!(CustomFieldType::try_from("blob".to_string()).is_err());

        let types = available_types();
        assert_eq!(types.as_array().unwrap().len(), 7);
        assert_eq!(types[0], json!({"value": "string", "label": "Short text"}));
    }

    #[test]
    fn booleans_are_stored_as_digits() {
        let def = definition(CustomFieldType::Boolean);
        assert_eq!(def.storage_value(&json!(true)).as_deref(), Some("1"));
        assert_eq!(def.storage_value(&json!("false")).as_deref(), Some("0"));
        assert_eq!(def.storage_value(&json!("")), None);
        assert_eq!(def.cast(Some("1")), json!(true));
        assert_eq!(def.cast(Some("0")), json!(false));
        assert_eq!(def.cast(None), Value::Null);
    }

    #[test]
    fn numbers_read_back_as_floats() {
        let def = definition(CustomFieldType::Number);
        assert_eq!(def.storage_value(&json!(12)).as_deref(), Some("12"));
        assert_eq!(def.cast(Some("12")), json!(12.0));
        assert_eq!(def.cast(Some("abc")), Value::Null);
    }

    #[test]
    fn descriptor_drops_unique() {
        let field = definition(CustomFieldType::String).to_field_descriptor();
        assert_eq!(field.key, "custom_gift_wrap");
        assert_eq!(field.field_type, FieldType::String);
        assert!(field.rules.required);
        assert!(!field.rules.unique);
    }

    #[test]
    fn form_field_carries_options_for_selects() {
        let mut def = definition(CustomFieldType::Select);
        def.options = Some(json!(["red", "blue"]));
        let field = def.to_form_field();
        assert_eq!(field["key"], "custom_gift_wrap");
        assert_eq!(field["custom_field"], true);
        assert_eq!(field["options"], json!(["red", "blue"]));

        let field = definition(CustomFieldType::Text).to_form_field();
        assert!(field.get("options").is_none());
    }

    #[test]
    fn input_validation() {
        let errors = CustomFieldInput::default().validate(true).unwrap_err();
        assert!(errors.get("label").is_some());
        assert!(errors.get("type").is_some());

        assert_eq!(CustomFieldInput::default().validate(false).unwrap(), None);

        let input = CustomFieldInput {
            label: Some("Colour".into()),
            field_type: Some("select".into()),
            ..Default::default()
        };
        assert_eq!(input.validate(true).unwrap(), Some(CustomFieldType::Select));

        let input = CustomFieldInput {
            field_type: Some("blob".into()),
            ..Default::default()
        };
        assert!(input.validate(false).unwrap_err().get("type").is_some());
    }
}
