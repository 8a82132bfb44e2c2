//! Declarative entity metadata.
//!
//! One [`EntityDefinition`] per resource, normally loaded from a YAML file.
//! Definitions are immutable once the registry is built.

use serde::{Deserialize, Serialize};

use crate::query::TemplateExpr;

/// Column type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Text,
    Email,
    Number,
    Decimal,
    Boolean,
    Date,
    Datetime,
    Select,
    Telephone,
    Image,
    File,
    Password,
}

impl FieldType {
    /// Display format used both for search matching and response shaping,
    /// as a Postgres `to_char` pattern.
    pub fn display_pattern(self) -> Option<&'static str> {
        match self {
            FieldType::Date => Some("DD-MM-YYYY"),
            FieldType::Datetime => Some("DD-MM-YYYY HH24:MI"),
            _ => None,
        }
    }

    /// Fields whose values are uploaded files stored on disk.
    pub fn is_upload(self) -> bool {
        matches!(self, FieldType::Image | FieldType::File)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Email => "email",
            FieldType::Number => "number",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Select => "select",
            FieldType::Telephone => "telephone",
            FieldType::Image => "image",
            FieldType::File => "file",
            FieldType::Password => "password",
        }
    }
}

/// Validation switches attached to a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRules {
    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub unique: bool,

    /// Maximum upload size in kilobytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,

    /// Comma separated list of accepted file extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimes: Option<String>,

    /// Names of application-registered rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom: Vec<String>,
}

/// A belongs-to link from the owning field to a row of another entity.
///
/// The owning field's key is the foreign key column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRef {
    /// Relation name, used in paths (`customer.address.city`) and as the
    /// key the loaded row is embedded under.
    pub name: String,

    /// Target entity name (unused for polymorphic links).
    #[serde(default)]
    pub entity: String,

    /// Composed label used in listings; also drives search and sort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_key: Option<TemplateExpr>,

    /// Composed label used in forms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_key: Option<TemplateExpr>,

    /// Polymorphic link: `entity` is ignored and the target entity name is
    /// read from the `morph_type` column.
    #[serde(default)]
    pub polymorphic: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub morph_type: Option<String>,

    #[serde(default = "default_key")]
    pub owner_key: String,
}

/// One attribute of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Column name; unique within the entity.
    pub key: String,

    /// Human-readable label.
    #[serde(default)]
    pub label: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Shown in listings; only table fields are searchable and sortable.
    #[serde(default)]
    pub table: bool,

    /// Accepted on create and update.
    #[serde(default)]
    pub form: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationRef>,

    /// Replaces the key when compiling search predicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_key: Option<String>,

    /// Replaces the key when compiling ORDER BY terms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_key: Option<String>,

    #[serde(default)]
    pub rules: FieldRules,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,

    #[serde(default)]
    pub multiple: bool,

    /// Uploaded files are publicly downloadable (otherwise private).
    #[serde(default)]
    pub public: bool,

    #[serde(default)]
    pub hidden: bool,

    /// Companion free-text field rendered next to a select.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combo_field: Option<String>,
}

impl FieldDescriptor {
    /// The hidden, required text field named by `combo_field`.
    pub fn combo_companion(&self) -> Option<FieldDescriptor> {
        let key = self.combo_field.as_ref()?;
        Some(FieldDescriptor {
            key: key.clone(),
            label: String::new(),
            field_type: FieldType::String,
            table: false,
            form: true,
            relation: None,
            search_key: None,
            order_key: None,
            rules: FieldRules {
                required: true,
                ..FieldRules::default()
            },
            options: Vec::new(),
            multiple: false,
            public: false,
            hidden: true,
            combo_field: None,
        })
    }

    /// Label, falling back to the key.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.key
        } else {
            &self.label
        }
    }
}

/// Kind of a many-valued association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalKind {
    #[default]
    BelongsToMany,
    HasMany,
}

/// A many-valued association (has-many or belongs-to-many through a pivot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRelationRef {
    pub name: String,

    #[serde(default)]
    pub label: String,

    pub entity: String,

    #[serde(default)]
    pub kind: ExternalKind,

    /// Pivot table for belongs-to-many.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_table: Option<String>,

    /// Column pointing back at the owning row (on the pivot or related table).
    pub foreign_key: String,

    /// Pivot column pointing at the related row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_key: Option<String>,

    #[serde(default = "default_key")]
    pub local_key: String,

    /// Extra columns stored on the pivot, validated like regular fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pivot_fields: Vec<FieldDescriptor>,

    /// Listed as a table column.
    #[serde(default)]
    pub table: bool,
}

/// Calendar projection of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarSpec {
    pub start: String,
    pub end: String,
    pub title: TemplateExpr,

    /// Emit separate start and end events instead of one range.
    #[serde(default)]
    pub separate_events: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_class: Option<String>,
}

/// Complete description of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Entity name as used in routes (`/dashboard/{name}`).
    pub name: String,

    pub table: String,

    /// Rows carry a nullable `deleted_at` column.
    #[serde(default)]
    pub soft_deletes: bool,

    /// Rows carry `created_at` / `updated_at` columns.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Extra eager-load paths (`customer.address`), on top of every
    /// field relation and external relation.
    #[serde(default)]
    pub includes: Vec<String>,

    pub fields: Vec<FieldDescriptor>,

    #[serde(default)]
    pub external_relations: Vec<ExternalRelationRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar: Option<CalendarSpec>,

    #[serde(default)]
    pub custom_fields_enabled: bool,
}

impl EntityDefinition {
    pub fn field(&self, key: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Fields shown in listings (eligible for search and sort).
    pub fn table_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.table)
    }

    /// Fields accepted on create and update.
    pub fn form_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.form)
    }

    /// Form fields followed by the combo companions not declared as fields
    /// of their own.
    pub fn editable_fields(&self) -> Vec<FieldDescriptor> {
        let mut fields: Vec<FieldDescriptor> = self.form_fields().cloned().collect();
        let companions: Vec<FieldDescriptor> = self
            .form_fields()
            .filter_map(FieldDescriptor::combo_companion)
            .filter(|c| self.field(&c.key).is_none())
            .collect();
        for companion in companions {
            if !fields.iter().any(|f| f.key == companion.key) {
                fields.push(companion);
            }
        }
        fields
    }

    pub fn external_relation(&self, name: &str) -> Option<&ExternalRelationRef> {
        self.external_relations.iter().find(|r| r.name == name)
    }
}

fn default_key() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}
