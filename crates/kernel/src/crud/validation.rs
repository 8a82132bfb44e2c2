//! Validation rules derived from field metadata.
//!
//! Every form field maps mechanically to a list of [`Rule`]s; a payload is
//! checked against them and failures are collected per field.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use sea_query::{Alias, Expr, PostgresQueryBuilder, Query};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use super::payload::{FormPayload, is_blank, scalar_text};
use crate::entity::casts::{parse_date_input, parse_datetime_input};
use crate::entity::{Entity, EntityRegistry, ExternalRelationRef, FieldDescriptor, FieldType};
use crate::file::UploadedFile;

/// Maximum length of string and email values.
pub const MAX_STRING_LENGTH: usize = 191;

/// Loose address shape: something, `@`, a dotted domain.
#[allow(clippy::expect_used)]
static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex literal"));

/// Failures keyed by field, in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, messages) in other.0 {
            self.0.entry(field).or_default().extend(messages);
        }
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} invalid field(s)", self.0.len())
    }
}

/// Where a uniqueness check looks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueScope {
    pub table: String,
    pub column: String,
    /// Only `true` values must be unique (one default flag per scope).
    pub boolean_only: bool,
    /// Row being updated, excluded from the check.
    pub ignore_id: Option<String>,
    /// For pivot fields: rows of the same owner, other related items.
    pub pivot: Option<PivotScope>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotScope {
    pub foreign_key: String,
    pub owner_id: String,
    pub related_key: String,
    pub item_id: String,
}

impl UniqueScope {
    /// `SELECT EXISTS (...)` for `value` in this scope.
    pub fn exists_sql(&self, value: &str) -> String {
        let table = Alias::new(&self.table);
        let column = Expr::col((table.clone(), Alias::new(&self.column)));

        let mut select = Query::select();
        select.expr(Expr::val(1)).from(table.clone());
        if self.boolean_only {
            select.and_where(column.eq(true));
        } else {
            select.and_where(Expr::cust_with_values(
                format!(r#""{}"."{}"::text = $1"#, self.table, self.column),
                [value],
            ));
        }
        if let Some(id) = &self.ignore_id {
            select.and_where(Expr::cust_with_values(
                format!(r#""{}"."id"::text <> $1"#, self.table),
                [id.as_str()],
            ));
        }
        if let Some(pivot) = &self.pivot {
            select.and_where(Expr::cust_with_values(
                format!(r#""{}"."{}"::text = $1"#, self.table, pivot.foreign_key),
                [pivot.owner_id.as_str()],
            ));
            select.and_where(Expr::cust_with_values(
                format!(r#""{}"."{}"::text <> $1"#, self.table, pivot.related_key),
                [pivot.item_id.as_str()],
            ));
        }

        format!("SELECT EXISTS ({})", select.to_string(PostgresQueryBuilder))
    }
}

/// Answers "is this value already taken".
#[async_trait]
pub trait UniqueChecker: Send + Sync {
    async fn is_taken(&self, scope: &UniqueScope, value: &str) -> Result<bool>;
}

/// Checks uniqueness against PostgreSQL.
pub struct PgUniqueChecker {
    pool: PgPool,
}

impl PgUniqueChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UniqueChecker for PgUniqueChecker {
    async fn is_taken(&self, scope: &UniqueScope, value: &str) -> Result<bool> {
        let sql = scope.exists_sql(value);
        debug!(sql = %sql, "unique check");
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("unique check on {}.{} failed", scope.table, scope.column))
    }
}

/// One check derived from a field descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Required,
    Nullable,
    String { max: Option<usize> },
    Email { max: usize },
    Integer,
    Decimal,
    Boolean,
    Date,
    Datetime,
    In { options: Vec<String> },
    ArrayIn { options: Vec<String> },
    Digits { min: usize, max: usize },
    Image,
    File,
    MaxKilobytes(u64),
    Mimes(Vec<String>),
    Unique,
    Custom(String),
}

/// Rules for one field.
///
/// `required` is not applied to images and passwords; every other field
/// without it is nullable.
pub fn derive_rules(field: &FieldDescriptor) -> Vec<Rule> {
    let mut rules = Vec::new();

    if field.rules.required {
        if !matches!(field.field_type, FieldType::Image | FieldType::Password) {
            rules.push(Rule::Required);
        }
    } else {
        rules.push(Rule::Nullable);
    }

    match field.field_type {
        FieldType::String => rules.push(Rule::String {
            max: Some(MAX_STRING_LENGTH),
        }),
        FieldType::Text | FieldType::Password => rules.push(Rule::String { max: None }),
        FieldType::Email => rules.push(Rule::Email {
            max: MAX_STRING_LENGTH,
        }),
        FieldType::Number => rules.push(Rule::Integer),
        FieldType::Decimal => rules.push(Rule::Decimal),
        FieldType::Boolean => rules.push(Rule::Boolean),
        FieldType::Date => rules.push(Rule::Date),
        FieldType::Datetime => rules.push(Rule::Datetime),
        FieldType::Select if !field.options.is_empty() => {
            let options = field.options.clone();
            rules.push(if field.multiple {
                Rule::ArrayIn { options }
            } else {
                Rule::In { options }
            });
        }
        FieldType::Select => {}
        FieldType::Telephone => rules.push(Rule::Digits { min: 8, max: 15 }),
        FieldType::Image | FieldType::File => {
            rules.push(if field.field_type == FieldType::Image {
                Rule::Image
            } else {
                Rule::File
            });
            if let Some(max) = field.rules.max {
                rules.push(Rule::MaxKilobytes(max));
            }
            if let Some(mimes) = &field.rules.mimes {
                rules.push(Rule::Mimes(
                    mimes
                        .split(',')
                        .map(|m| m.trim().to_ascii_lowercase())
                        .filter(|m| !m.is_empty())
                        .collect(),
                ));
            }
        }
    }

    if field.rules.unique {
        rules.push(Rule::Unique);
    }
    rules.extend(field.rules.custom.iter().cloned().map(Rule::Custom));

    rules
}

/// Checks payloads against derived rules.
pub struct Validator<'a> {
    registry: &'a EntityRegistry,
    unique: &'a dyn UniqueChecker,
}

impl<'a> Validator<'a> {
    pub fn new(registry: &'a EntityRegistry, unique: &'a dyn UniqueChecker) -> Self {
        Self { registry, unique }
    }

    /// Validate the form fields of `entity`. `id` is the row being
    /// updated, `None` on create.
    pub async fn validate_form(
        &self,
        entity: &Entity,
        payload: &FormPayload,
        id: Option<&str>,
    ) -> Result<ValidationErrors> {
        let mut errors = ValidationErrors::default();
        for field in &entity.definition().editable_fields() {
            let scope = UniqueScope {
                table: entity.table().to_string(),
                column: field.key.clone(),
                boolean_only: field.field_type == FieldType::Boolean,
                ignore_id: id.map(str::to_string),
                pivot: None,
            };
            self.check_field(field, payload, id.is_none(), &scope, &mut errors)
                .await?;
        }
        Ok(errors)
    }

    /// Validate runtime-defined fields of `entity`. They are never unique.
    pub async fn validate_extra(
        &self,
        entity: &Entity,
        fields: &[FieldDescriptor],
        payload: &FormPayload,
        id: Option<&str>,
    ) -> Result<ValidationErrors> {
        let mut errors = ValidationErrors::default();
        for field in fields {
            let scope = UniqueScope {
                table: entity.table().to_string(),
                column: field.key.clone(),
                boolean_only: false,
                ignore_id: id.map(str::to_string),
                pivot: None,
            };
            self.check_field(field, payload, id.is_none(), &scope, &mut errors)
                .await?;
        }
        Ok(errors)
    }

    /// Validate pivot data for `item` attached to row `id`.
    pub async fn validate_pivot(
        &self,
        relation: &ExternalRelationRef,
        payload: &FormPayload,
        id: &str,
        item: &str,
    ) -> Result<ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let (Some(pivot_table), Some(related_key)) =
            (relation.pivot_table.as_ref(), relation.related_key.as_ref())
        else {
            return Ok(errors);
        };
        for field in &relation.pivot_fields {
            let scope = UniqueScope {
                table: pivot_table.clone(),
                column: field.key.clone(),
                boolean_only: field.field_type == FieldType::Boolean,
                ignore_id: None,
                pivot: Some(PivotScope {
                    foreign_key: relation.foreign_key.clone(),
                    owner_id: id.to_string(),
                    related_key: related_key.clone(),
                    item_id: item.to_string(),
                }),
            };
            self.check_field(field, payload, true, &scope, &mut errors)
                .await?;
        }
        Ok(errors)
    }

    async fn check_field(
        &self,
        field: &FieldDescriptor,
        payload: &FormPayload,
        creating: bool,
        scope: &UniqueScope,
        errors: &mut ValidationErrors,
    ) -> Result<()> {
        let key = field.key.as_str();
        let label = field.display_label();
        let rules = derive_rules(field);

        if field.field_type.is_upload() {
            let files = payload.files(key);
            if files.is_empty() {
                // A stored file satisfies `required` on update.
                if creating && rules.contains(&Rule::Required) {
                    errors.add(key, format!("The {label} field is required."));
                }
                return Ok(());
            }
            for file in files {
                for rule in &rules {
                    if let Some(message) = check_upload(rule, label, file) {
                        errors.add(key, message);
                    }
                }
            }
            return Ok(());
        }

        let value = payload.get(key).unwrap_or(&Value::Null);
        if is_blank(value) {
            if rules.contains(&Rule::Required) {
                errors.add(key, format!("The {label} field is required."));
            }
            return Ok(());
        }

        for rule in &rules {
            let message = match rule {
                Rule::Unique => self.check_unique(scope, value, label).await?,
                Rule::Custom(name) => match self.registry.custom_rule(name) {
                    Some(custom) => custom.check(key, value).err(),
                    None => None,
                },
                rule => check_value(rule, label, value),
            };
            if let Some(message) = message {
                errors.add(key, message);
            }
        }
        Ok(())
    }

    async fn check_unique(
        &self,
        scope: &UniqueScope,
        value: &Value,
        label: &str,
    ) -> Result<Option<String>> {
        if scope.boolean_only && !crate::query::listing::as_flag(value) {
            return Ok(None);
        }
        let Some(text) = scalar_text(value) else {
            return Ok(None);
        };
        let taken = self.unique.is_taken(scope, &text).await?;
        Ok(taken.then(|| format!("The {label} has already been taken.")))
    }
}

/// Check a non-blank scalar value against a rule. Rules that need the
/// database or the registry return `None` here.
pub fn check_value(rule: &Rule, label: &str, value: &Value) -> Option<String> {
    let text = scalar_text(value);
    let fail = |message: String| Some(message);

    match rule {
        Rule::String { max } => match (&text, max) {
            (None, _) => fail(format!("The {label} field must be a string.")),
            (Some(s), Some(max)) if s.chars().count() > *max => fail(format!(
                "The {label} field must not be greater than {max} characters."
            )),
            _ => None,
        },
        Rule::Email { max } => match &text {
            Some(s) if EMAIL.is_match(s) && s.chars().count() <= *max => None,
            Some(s) if EMAIL.is_match(s) => fail(format!(
                "The {label} field must not be greater than {max} characters."
            )),
            _ => fail(format!("The {label} field must be a valid email address.")),
        },
        Rule::Integer => {
            let ok = match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.trim().parse::<i64>().is_ok(),
                _ => false,
            };
            (!ok).then(|| format!("The {label} field must be an integer."))
        }
        Rule::Decimal => {
            let ok = match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok_and(f64::is_finite),
                _ => false,
            };
            (!ok).then(|| format!("The {label} field must be a number."))
        }
        Rule::Boolean => {
            let ok = match value {
                Value::Bool(_) => true,
                Value::Number(n) => matches!(n.as_i64(), Some(0 | 1)),
                Value::String(s) => matches!(s.trim(), "0" | "1" | "true" | "false"),
                _ => false,
            };
            (!ok).then(|| format!("The {label} field must be true or false."))
        }
        Rule::Date => text
            .as_deref()
            .and_then(parse_date_input)
            .is_none()
            .then(|| format!("The {label} field must be a valid date.")),
        Rule::Datetime => text
            .as_deref()
            .and_then(parse_datetime_input)
            .is_none()
            .then(|| format!("The {label} field must be a valid date.")),
        Rule::In { options } => match &text {
            Some(s) if options.iter().any(|o| o == s.trim()) => None,
            _ => fail(format!("The selected {label} is invalid.")),
        },
        Rule::ArrayIn { options } => {
            let Value::Array(items) = value else {
                return fail(format!("The {label} field must be an array."));
            };
            items.iter().find_map(|item| {
                let option = scalar_text(item).unwrap_or_default();
                (!options.iter().any(|o| o == option.trim()))
                    .then(|| format!("The selected option '{option}' is not valid."))
            })
        }
        Rule::Digits { min, max } => match &text {
            Some(s)
                if s.chars().all(|c| c.is_ascii_digit())
                    && (*min..=*max).contains(&s.len()) =>
            {
                None
            }
            _ => fail(format!(
                "The {label} field must be between {min} and {max} digits."
            )),
        },
        // A plain value for an upload field (e.g. the stored path) is
        // left alone.
        Rule::Image | Rule::File | Rule::MaxKilobytes(_) | Rule::Mimes(_) => None,
        Rule::Required | Rule::Nullable | Rule::Unique | Rule::Custom(_) => None,
    }
}

fn check_upload(rule: &Rule, label: &str, file: &UploadedFile) -> Option<String> {
    match rule {
        Rule::Image => (!infer::is_image(&file.data))
            .then(|| format!("The {label} field must be an image.")),
        Rule::MaxKilobytes(max) => (file.size_kb() > *max).then(|| {
            format!("The {label} field must not be greater than {max} kilobytes.")
        }),
        Rule::Mimes(extensions) => {
            let ok = file
                .extension()
                .is_some_and(|ext| extensions.iter().any(|e| *e == ext));
            (!ok).then(|| {
                format!(
                    "The {label} field must be a file of type: {}.",
                    extensions.join(", ")
                )
            })
        }
        _ => None,
    }
}
