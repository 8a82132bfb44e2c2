//! Column values and statements for create, update and delete.

use anyhow::{Context, Result};
use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHasher};
use sea_query::{Alias, Expr, PostgresQueryBuilder, Query, SimpleExpr};
use serde_json::Value;

use super::payload::{FormPayload, is_blank, scalar_text};
use crate::entity::casts::{
    DATE_STORAGE, DATETIME_STORAGE, parse_date_input, parse_datetime_input,
};
use crate::entity::{Entity, EntityDefinition, FieldDescriptor, FieldType};
use crate::query::TrashScope;
use crate::query::sql::{qualified, quote};

/// A value about to be written to a column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Text(String),
    /// The database clock.
    Now,
}

impl From<ColumnValue> for SimpleExpr {
    fn from(value: ColumnValue) -> Self {
        match value {
            ColumnValue::Null => SimpleExpr::from(None::<String>),
            ColumnValue::Bool(b) => SimpleExpr::from(b),
            ColumnValue::Text(s) => SimpleExpr::from(s),
            ColumnValue::Now => Expr::cust("NOW()"),
        }
    }
}

/// Ordered `(column, value)` pairs.
pub type Columns = Vec<(String, ColumnValue)>;

/// Hash a password using Argon2id.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Convert a submitted value for storage in `field`'s column.
pub fn column_value(field: &FieldDescriptor, value: &Value) -> Result<ColumnValue> {
    if is_blank(value) {
        return Ok(ColumnValue::Null);
    }

    let text = || scalar_text(value).unwrap_or_else(|| value.to_string());
    let converted = match field.field_type {
        FieldType::Boolean => ColumnValue::Bool(crate::query::listing::as_flag(value)),
        FieldType::Select if field.multiple => {
            let items: Vec<String> = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(scalar_text)
                    .map(|s| s.trim().to_string())
                    .collect(),
                other => scalar_text(other).into_iter().collect(),
            };
            ColumnValue::Text(items.join(", "))
        }
        FieldType::Date => {
            let raw = text();
            match parse_date_input(&raw) {
                Some(date) => ColumnValue::Text(date.format(DATE_STORAGE).to_string()),
                None => ColumnValue::Text(raw),
            }
        }
        FieldType::Datetime => {
            let raw = text();
            match parse_datetime_input(&raw) {
                Some(at) => ColumnValue::Text(at.format(DATETIME_STORAGE).to_string()),
                None => ColumnValue::Text(raw),
            }
        }
        FieldType::Password => ColumnValue::Text(hash_password(&text())?),
        _ => ColumnValue::Text(text()),
    };
    Ok(converted)
}

/// Non-upload columns set by a form payload.
///
/// Keys absent from the payload are left alone; blank passwords are
/// never written.
pub fn form_columns(def: &EntityDefinition, payload: &FormPayload) -> Result<Columns> {
    let mut columns = Columns::new();
    for field in def.editable_fields() {
        if field.field_type.is_upload() || !payload.contains(&field.key) {
            continue;
        }
        if field.field_type == FieldType::Password && payload.is_blank(&field.key) {
            continue;
        }
        let value = payload.get(&field.key).unwrap_or(&Value::Null);
        columns.push((field.key.clone(), column_value(&field, value)?));
    }
    Ok(columns)
}

/// Pivot columns set by a payload.
pub fn pivot_columns(fields: &[FieldDescriptor], payload: &FormPayload) -> Result<Columns> {
    let mut columns = Columns::new();
    for field in fields {
        if let Some(value) = payload.get(&field.key) {
            columns.push((field.key.clone(), column_value(field, value)?));
        }
    }
    Ok(columns)
}

/// Paths of a multi-file column, stored as a JSON array.
pub fn stored_paths(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(raw)) => serde_json::from_str::<Vec<String>>(raw).unwrap_or_default(),
        Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
        _ => Vec::new(),
    }
}

/// Column value for a multi-file path list.
pub fn paths_value(paths: &[String]) -> Result<ColumnValue> {
    if paths.is_empty() {
        return Ok(ColumnValue::Null);
    }
    let encoded = serde_json::to_string(paths).context("failed to encode file paths")?;
    Ok(ColumnValue::Text(encoded))
}

fn id_matches(column: &str, id: &str) -> SimpleExpr {
    Expr::cust_with_values(format!("{column}::text = $1"), [id])
}

/// `INSERT ... RETURNING "id"::text`.
pub fn insert_sql(table: &str, columns: Columns) -> Result<String> {
    if columns.is_empty() {
        return Ok(format!(
            r#"INSERT INTO {} DEFAULT VALUES RETURNING "id"::text"#,
            quote(table)
        ));
    }
    let (names, values): (Vec<String>, Vec<ColumnValue>) = columns.into_iter().unzip();
    let mut insert = Query::insert();
    insert
        .into_table(Alias::new(table))
        .columns(names.iter().map(Alias::new))
        .values(values.into_iter().map(SimpleExpr::from))
        .context("column and value counts differ")?;
    Ok(format!(
        r#"{} RETURNING "id"::text"#,
        insert.to_string(PostgresQueryBuilder)
    ))
}

/// `UPDATE` of one row; `None` when there is nothing to set.
pub fn update_sql(table: &str, id: &str, columns: Columns) -> Option<String> {
    if columns.is_empty() {
        return None;
    }
    let mut update = Query::update();
    update
        .table(Alias::new(table))
        .values(
            columns
                .into_iter()
                .map(|(name, value)| (Alias::new(name), SimpleExpr::from(value))),
        )
        .and_where(id_matches(&quote("id"), id));
    Some(update.to_string(PostgresQueryBuilder))
}

/// `DELETE` of one row.
pub fn delete_sql(table: &str, id: &str) -> String {
    let mut delete = Query::delete();
    delete
        .from_table(Alias::new(table))
        .and_where(id_matches(&quote("id"), id));
    delete.to_string(PostgresQueryBuilder)
}

/// One row as JSON, within a trash scope.
pub fn find_sql(entity: &Entity, id: &str, scope: TrashScope) -> String {
    let table = entity.table();
    let mut select = Query::select();
    select
        .expr_as(
            Expr::cust(format!("row_to_json({})", quote(table))),
            Alias::new("row"),
        )
        .from(Alias::new(table))
        .and_where(id_matches(&qualified(table, "id"), id));
    if let Some(condition) = scope.condition(entity, table) {
        select.and_where(condition);
    }
    select.to_string(PostgresQueryBuilder)
}

/// Every row of a trash scope, oldest id first.
pub fn all_sql(entity: &Entity, scope: TrashScope) -> String {
    let table = entity.table();
    let mut select = Query::select();
    select
        .expr_as(
            Expr::cust(format!("row_to_json({})", quote(table))),
            Alias::new("row"),
        )
        .from(Alias::new(table))
        .order_by_expr(Expr::cust(qualified(table, "id")), sea_query::Order::Asc);
    if let Some(condition) = scope.condition(entity, table) {
        select.and_where(condition);
    }
    select.to_string(PostgresQueryBuilder)
}

/// The link between an owner row and a related item in a pivot table.
#[derive(Debug, Clone, Copy)]
pub struct PivotLink<'a> {
    pub table: &'a str,
    pub foreign_key: &'a str,
    pub owner: &'a str,
    pub related_key: &'a str,
    pub item: &'a str,
}

impl PivotLink<'_> {
    pub fn insert_sql(&self, mut columns: Columns) -> Result<String> {
        columns.insert(0, (self.foreign_key.to_string(), ColumnValue::Text(self.owner.to_string())));
        columns.insert(1, (self.related_key.to_string(), ColumnValue::Text(self.item.to_string())));
        let (names, values): (Vec<String>, Vec<ColumnValue>) = columns.into_iter().unzip();
        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(self.table))
            .columns(names.iter().map(Alias::new))
            .values(values.into_iter().map(SimpleExpr::from))
            .context("column and value counts differ")?;
        Ok(insert.to_string(PostgresQueryBuilder))
    }

    pub fn update_sql(&self, columns: Columns) -> Option<String> {
        if columns.is_empty() {
            return None;
        }
        let mut update = Query::update();
        update
            .table(Alias::new(self.table))
            .values(
                columns
                    .into_iter()
                    .map(|(name, value)| (Alias::new(name), SimpleExpr::from(value))),
            )
            .and_where(id_matches(&quote(self.foreign_key), self.owner))
            .and_where(id_matches(&quote(self.related_key), self.item));
        Some(update.to_string(PostgresQueryBuilder))
    }

    pub fn delete_sql(&self) -> String {
        let mut delete = Query::delete();
        delete
            .from_table(Alias::new(self.table))
            .and_where(id_matches(&quote(self.foreign_key), self.owner))
            .and_where(id_matches(&quote(self.related_key), self.item));
        delete.to_string(PostgresQueryBuilder)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::shop_registry;
    use argon2::{PasswordHash, PasswordVerifier};
    use serde_json::json;

    fn field(value: Value) -> FieldDescriptor {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn converts_submitted_values() {
        let multi = field(json!({"key": "labels", "type": "select", "multiple": true}));
        assert_eq!(
            column_value(&multi, &json!(["a", " b"])).unwrap(),
            ColumnValue::Text("a, b".into())
        );

        let date = field(json!({"key": "d", "type": "date"}));
        assert_eq!(
            column_value(&date, &json!("31-12-2024")).unwrap(),
            ColumnValue::Text("2024-12-31".into())
        );

        let at = field(json!({"key": "at", "type": "datetime"}));
        assert_eq!(
            column_value(&at, &json!("31-12-2024 08:30")).unwrap(),
            ColumnValue::Text("2024-12-31 08:30:00".into())
        );

        let flag = field(json!({"key": "f", "type": "boolean"}));
        assert_eq!(column_value(&flag, &json!("1")).unwrap(), ColumnValue::Bool(true));
        assert_eq!(column_value(&flag, &json!(false)).unwrap(), ColumnValue::Bool(false));

        let number = field(json!({"key": "n", "type": "number"}));
        assert_eq!(column_value(&number, &json!(5)).unwrap(), ColumnValue::Text("5".into()));
        assert_eq!(column_value(&number, &json!("")).unwrap(), ColumnValue::Null);
    }

    #[test]
    fn passwords_are_hashed() {
        let password = field(json!({"key": "password", "type": "password"}));
        let ColumnValue::Text(hash) = column_value(&password, &json!("s3cret")).unwrap() else {
            panic!("expected text");
        };
        assert!(hash.starts_with("$argon2"));
        let parsed = PasswordHash::new(&hash).unwrap();
        assert!(Argon2::default().verify_password(b"s3cret", &parsed).is_ok());
    }

    #[test]
    fn form_columns_skip_absent_keys_uploads_and_blank_passwords() {
        let registry = shop_registry();
        let customer = registry.get("customer").unwrap();
        let payload = FormPayload::from_json(json!({
            "first_name": "Ada",
            "last_name": "",
            "password": "",
            "unknown": "x"
        }));
        let columns = form_columns(customer.definition(), &payload).unwrap();
        assert_eq!(
            columns,
            [
                ("first_name".to_string(), ColumnValue::Text("Ada".into())),
                ("last_name".to_string(), ColumnValue::Null),
            ]
        );

        let order = registry.get("order").unwrap();
        let payload = FormPayload::from_json(json!({"code": "A1", "invoice": "keep-me"}));
        let columns = form_columns(order.definition(), &payload).unwrap();
        assert_eq!(columns.len(), 1);
    }

    #[test]
    fn multi_file_paths() {
        assert_eq!(
            stored_paths(Some(&json!(r#"["a/1_0_x.png","a/1_1_y.png"]"#))),
            ["a/1_0_x.png", "a/1_1_y.png"]
        );
        assert_eq!(stored_paths(Some(&json!(["a"]))), ["a"]);
        assert!(stored_paths(Some(&json!("not json"))).is_empty());
        assert!(stored_paths(None).is_empty());

        assert_eq!(paths_value(&[]).unwrap(), ColumnValue::Null);
        assert_eq!(
            paths_value(&["a".to_string()]).unwrap(),
            ColumnValue::Text(r#"["a"]"#.into())
        );
    }

    #[test]
    fn insert_statements() {
        let sql = insert_sql(
            "orders",
            vec![
                ("code".into(), ColumnValue::Text("A1".into())),
                ("total".into(), ColumnValue::Null),
                ("paid".into(), ColumnValue::Bool(true)),
                ("created_at".into(), ColumnValue::Now),
            ],
        )
        .unwrap();
        assert_eq!(
            sql,
            r#"INSERT INTO "orders" ("code", "total", "paid", "created_at") VALUES ('A1', NULL, TRUE, NOW()) RETURNING "id"::text"#
        );

        assert_eq!(
            insert_sql("tags", Vec::new()).unwrap(),
            r#"INSERT INTO "tags" DEFAULT VALUES RETURNING "id"::text"#
        );
    }

    #[test]
    fn update_and_delete_statements() {
        let sql = update_sql(
            "orders",
            "7",
            vec![("code".into(), ColumnValue::Text("B2".into()))],
        )
        .unwrap();
        assert_eq!(
            sql,
            r#"UPDATE "orders" SET "code" = 'B2' WHERE "id"::text = '7'"#
        );
        assert!(update_sql("orders", "7", Vec::new()).is_none());

        assert_eq!(
            delete_sql("orders", "7"),
            r#"DELETE FROM "orders" WHERE "id"::text = '7'"#
        );
    }

    #[test]
    fn find_respects_trash_scope() {
        let registry = shop_registry();
        let order = registry.get("order").unwrap();

        let active = find_sql(order, "3", TrashScope::Active);
        assert!(active.contains(r#""orders"."id"::text = '3'"#), "{active}");
        assert!(active.contains(r#""orders"."deleted_at" IS NULL"#), "{active}");

        let trashed = find_sql(order, "3", TrashScope::OnlyTrashed);
        assert!(trashed.contains(r#""orders"."deleted_at" IS NOT NULL"#), "{trashed}");

        let tag = registry.get("tag").unwrap();
        let any = find_sql(tag, "3", TrashScope::Active);
        assert!(!any.contains("deleted_at"), "{any}");
    }

    #[test]
    fn pivot_statements() {
        let link = PivotLink {
            table: "order_tag",
            foreign_key: "order_id",
            owner: "1",
            related_key: "tag_id",
            item: "2",
        };

        let insert = link
            .insert_sql(vec![("note".into(), ColumnValue::Text("gift".into()))])
            .unwrap();
        assert_eq!(
            insert,
            r#"INSERT INTO "order_tag" ("order_id", "tag_id", "note") VALUES ('1', '2', 'gift')"#
        );

        let update = link
            .update_sql(vec![("note".into(), ColumnValue::Null)])
            .unwrap();
        assert!(update.starts_with(r#"UPDATE "order_tag" SET "note" = NULL WHERE"#), "{update}");
        assert!(update.contains(r#""order_id"::text = '1'"#), "{update}");
        assert!(update.contains(r#""tag_id"::text = '2'"#), "{update}");

        let delete = link.delete_sql();
        assert!(delete.starts_with(r#"DELETE FROM "order_tag" WHERE"#), "{delete}");
    }
}
