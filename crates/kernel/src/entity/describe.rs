//! The `model` description clients use to render forms and tables.

use serde_json::{Map, Value, json};

use super::registry::Entity;
use super::types::{ExternalRelationRef, FieldDescriptor};
use crate::crud::CustomFieldDefinition;

/// Route prefix of an entity.
pub fn endpoint(entity: &str) -> String {
    format!("/dashboard/{entity}")
}

fn field_json(field: &FieldDescriptor) -> Value {
    let mut value = serde_json::to_value(field).unwrap_or(Value::Null);
    if let Some(relation) = field.relation.as_ref().filter(|r| !r.polymorphic) {
        if let Some(Value::Object(rel)) = value.get_mut("relation") {
            rel.insert("endPoint".into(), json!(endpoint(&relation.entity)));
        }
    }
    value
}

fn external_json(relation: &ExternalRelationRef) -> Value {
    let mut value = serde_json::to_value(relation).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("endPoint".into(), json!(endpoint(&relation.entity)));
        map.insert(
            "pivot_fields".into(),
            Value::Array(relation.pivot_fields.iter().map(field_json).collect()),
        );
    }
    value
}

/// Form fields: declared form fields with combo companions, then custom
/// fields.
pub fn form_fields(entity: &Entity, custom: &[CustomFieldDefinition]) -> Vec<Value> {
    let mut fields: Vec<Value> = entity
        .definition()
        .editable_fields()
        .iter()
        .map(field_json)
        .collect();
    fields.extend(custom.iter().map(CustomFieldDefinition::to_form_field));
    fields
}

/// Listing columns, ending with the actions column.
pub fn table_headers(entity: &Entity, custom: &[CustomFieldDefinition]) -> Vec<Value> {
    let def = entity.definition();
    let mut headers: Vec<Value> = def
        .table_fields()
        .map(|field| {
            let mut header = Map::new();
            header.insert("title".into(), json!(field.display_label()));
            header.insert("sortable".into(), json!(true));
            header.insert("key".into(), json!(field.key));
            header.insert("align".into(), json!("center"));
            match field.relation.as_ref().filter(|r| !r.polymorphic) {
                Some(relation) => {
                    let mut value = serde_json::to_value(relation).unwrap_or(Value::Null);
                    if let Value::Object(map) = &mut value {
                        map.insert("endPoint".into(), json!(endpoint(&relation.entity)));
                    }
                    header.insert("relation".into(), value);
                }
                None => {
                    header.insert("type".into(), json!(field.field_type.as_str()));
                }
            }
            Value::Object(header)
        })
        .collect();

    for definition in custom.iter().filter(|d| d.show_in_table) {
        headers.push(json!({
            "title": definition.label,
            "key": definition.key(),
            "sortable": true,
            "align": "center",
            "type": definition.field_type.as_str(),
            "isCustomField": true,
        }));
    }

    for relation in def.external_relations.iter().filter(|r| r.table) {
        let title = if relation.label.is_empty() {
            &relation.name
        } else {
            &relation.label
        };
        headers.push(json!({
            "title": title,
            "key": relation.name,
            "sortable": false,
            "align": "center",
        }));
    }

    headers.push(json!({
        "title": "Actions",
        "key": "actions",
        "sortable": false,
        "align": "center",
    }));
    headers
}

/// Full description of `entity`. `custom` holds its active custom fields.
pub fn describe(entity: &Entity, custom: &[CustomFieldDefinition]) -> Value {
    let def = entity.definition();
    json!({
        "endPoint": endpoint(entity.name()),
        "formFields": form_fields(entity, custom),
        "tableHeaders": table_headers(entity, custom),
        "externalRelations": def.external_relations.iter().map(external_json).collect::<Vec<_>>(),
        "calendarFields": def.calendar,
        "customFieldsEnabled": def.custom_fields_enabled,
    })
}
