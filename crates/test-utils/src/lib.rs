//! Autocrud test utilities.
//!
//! Helpers for integration testing: entity definition fixtures, JSON row
//! builders and assertion utilities for generated SQL and API responses.

use serde_json::Value as JsonValue;

/// YAML entity definitions describing a small shop.
///
/// `order` belongs to `customer`, which belongs to `address`, which belongs
/// to `country`. Orders have tags through a pivot table and order lines as
/// a has-many relation.
pub mod fixtures {
    pub const COUNTRY: &str = r#"
name: country
table: countries
fields:
  - { key: name, label: Name, type: string, table: true, form: true, rules: { required: true, unique: true } }
  - { key: code, label: Code, type: string, table: true, form: true }
"#;

    pub const ADDRESS: &str = r#"
name: address
table: addresses
fields:
  - { key: street, label: Street, type: string, table: true, form: true }
  - { key: city, label: City, type: string, table: true, form: true }
  - key: country_id
    label: Country
    type: number
    table: true
    form: true
    relation: { name: country, entity: country, table_key: name }
"#;

    pub const CUSTOMER: &str = r#"
name: customer
table: customers
soft_deletes: true
fields:
  - { key: first_name, label: First name, type: string, table: true, form: true, rules: { required: true } }
  - { key: last_name, label: Last name, type: string, table: true, form: true }
  - { key: email, label: Email, type: email, table: true, form: true, rules: { required: true, unique: true } }
  - { key: birth_date, label: Birth date, type: date, table: true, form: true }
  - { key: password, label: Password, type: password, form: true }
  - key: address_id
    label: Address
    type: number
    table: true
    form: true
    relation:
      name: address
      entity: address
      table_key: "{street}, {city} ({country.name})"
"#;

    pub const ORDER: &str = r#"
name: order
table: orders
soft_deletes: true
custom_fields_enabled: true
includes:
  - customer.address.country
fields:
  - { key: code, label: Code, type: string, table: true, form: true, rules: { required: true, unique: true } }
  - { key: placed_at, label: Placed at, type: datetime, table: true, form: true }
  - { key: delivered_at, label: Delivered at, type: datetime, form: true }
  - { key: total, label: Total, type: decimal, table: true, form: true }
  - key: status
    label: Status
    type: select
    table: true
    form: true
    options: [pending, paid, shipped]
  - key: customer_id
    label: Customer
    type: number
    table: true
    form: true
    rules: { required: true }
    relation:
      name: customer
      entity: customer
      table_key: "{first_name} {last_name}"
  - key: customer_country
    label: Country
    type: string
    table: true
    search_key: customer.address.country.name
    order_key: customer.address.country.name
  - { key: invoice, label: Invoice, type: file, form: true, rules: { max: 2048, mimes: "pdf" } }
  - { key: photo, label: Photo, type: image, form: true, public: true }
external_relations:
  - name: tags
    label: Tags
    entity: tag
    pivot_table: order_tag
    foreign_key: order_id
    related_key: tag_id
    table: true
    pivot_fields:
      - { key: note, label: Note, type: string, form: true }
  - { name: lines, label: Lines, entity: order_line, kind: has_many, foreign_key: order_id }
calendar:
  start: placed_at
  end: delivered_at
  title: "{code} - {customer.first_name}"
  start_class: order-placed
  end_class: order-delivered
"#;

    pub const TAG: &str = r#"
name: tag
table: tags
timestamps: false
fields:
  - { key: name, label: Name, type: string, table: true, form: true, rules: { required: true, unique: true } }
"#;

    pub const ORDER_LINE: &str = r#"
name: order_line
table: order_lines
soft_deletes: true
fields:
  - { key: product, label: Product, type: string, table: true, form: true }
  - { key: quantity, label: Quantity, type: number, table: true, form: true }
  - key: order_id
    label: Order
    type: number
    table: true
    form: true
    relation: { name: order, entity: order, table_key: "{code}" }
"#;

    /// Comments attach to any shop row through a polymorphic link. Not
    /// part of [`shop`].
    pub const COMMENT: &str = r#"
name: comment
table: comments
fields:
  - { key: body, label: Body, type: text, table: true, form: true }
  - key: commentable_id
    label: About
    type: number
    table: true
    relation:
      name: commentable
      polymorphic: true
      morph_type: commentable_type
      table_key: name
"#;

    /// A second address link on `order` whose relation name equals the
    /// derived alias of `customer.address`.
    pub const SHIP_ADDRESS_FIELD: &str = r#"
key: ship_address_id
label: Ship to
type: number
table: true
relation: { name: customer_address, entity: address, table_key: street }
"#;

    /// Every shop entity, in dependency order.
    pub fn shop() -> [&'static str; 6] {
        [COUNTRY, ADDRESS, CUSTOMER, ORDER, TAG, ORDER_LINE]
    }
}

/// Create a test row with an id.
pub fn test_row(id: i64) -> TestRow {
    TestRow {
        values: serde_json::json!({ "id": id }),
    }
}

/// A JSON row builder, shaped like the output of `row_to_json`.
#[derive(Debug, Clone)]
pub struct TestRow {
    pub values: JsonValue,
}

impl TestRow {
    /// Set a column.
    pub fn with(mut self, column: &str, value: JsonValue) -> Self {
        if let Some(obj) = self.values.as_object_mut() {
            obj.insert(column.to_string(), value);
        }
        self
    }

    /// Set a text column.
    pub fn with_text(self, column: &str, value: &str) -> Self {
        self.with(column, JsonValue::String(value.to_string()))
    }

    /// Mark as soft-deleted.
    pub fn trashed(self) -> Self {
        self.with_text("deleted_at", "2024-01-01T00:00:00")
    }

    /// Set creation and update timestamps.
    pub fn stamped(self, at: &str) -> Self {
        self.with_text("created_at", at).with_text("updated_at", at)
    }

    pub fn build(self) -> JsonValue {
        self.values
    }
}

/// Assertion helpers for JSON responses and SQL text.
pub mod assert {
    use serde_json::Value;

    /// Assert that a JSON value has a specific key.
    pub fn has_key(value: &Value, key: &str) {
        assert!(
            value.get(key).is_some(),
            "Expected JSON to have key '{key}', got: {value}"
        );
    }

    /// Assert that a JSON value equals expected.
    pub fn json_eq(actual: &Value, expected: &Value) {
        assert_eq!(
            actual,
            expected,
            "JSON mismatch:\nactual: {}\nexpected: {}",
            serde_json::to_string_pretty(actual).unwrap_or_default(),
            serde_json::to_string_pretty(expected).unwrap_or_default()
        );
    }

    /// Assert that SQL text contains a fragment.
    pub fn contains(haystack: &str, needle: &str) {
        assert!(
            haystack.contains(needle),
            "Expected SQL to contain '{needle}'\nActual: {haystack}"
        );
    }

    /// Assert that SQL text does not contain a fragment.
    pub fn not_contains(haystack: &str, needle: &str) {
        assert!(
            !haystack.contains(needle),
            "Expected SQL to NOT contain '{needle}'\nActual: {haystack}"
        );
    }

    /// Assert how many times a fragment occurs in SQL text.
    pub fn occurrences(haystack: &str, needle: &str, expected: usize) {
        let actual = haystack.matches(needle).count();
        assert_eq!(
            actual, expected,
            "Expected '{needle}' {expected} time(s), found {actual}\nActual: {haystack}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_builder() {
        let row = test_row(7)
            .with_text("code", "A1")
            .with("total", serde_json::json!(12.5))
            .trashed()
            .build();

        assert_eq!(row["id"], 7);
        assert_eq!(row["code"], "A1");
        assert_eq!(row["total"], 12.5);
        assert!(row["deleted_at"].is_string());
    }

    #[test]
    fn test_assertions() {
        let json = serde_json::json!({"name": "test", "value": 42});
        assert::has_key(&json, "name");
        assert::json_eq(&json["value"], &serde_json::json!(42));

        assert::contains("SELECT 1 FROM x", "FROM x");
        assert::not_contains("SELECT 1 FROM x", "JOIN");
        assert::occurrences("a AND b AND c", "AND", 2);
    }

    #[test]
    fn fixtures_are_named() {
        for yaml in fixtures::shop() {
            assert!(yaml.contains("\nname: "), "{yaml}");
            assert!(yaml.contains("\ntable: "), "{yaml}");
        }
    }
}
