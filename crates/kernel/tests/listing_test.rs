#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Listing statements compiled from request bodies, end to end.

mod common;

use autocrud_kernel::query::listing::compile;
use autocrud_kernel::query::{ListingRequest, PageSize};
use serde_json::json;

#[test]
fn search_and_sort_share_join_aliases() {
    let registry = common::registry();
    let order = registry.get("order").unwrap();
    let request = ListingRequest::from_body(&json!({
        "search": {"customer_id": "ana"},
        "sortBy": [
            {"key": "customer_country", "order": "asc"},
            {"key": "customer_id", "order": "desc"}
        ]
    }))
    .unwrap();

    let ctx = compile(&registry, order, &request).unwrap();
    let sql = ctx.page_sql(10, 0);

    // customer, customer.address, customer.address.country
    assert_eq!(sql.matches("LEFT JOIN").count(), 3, "{sql}");
    assert_eq!(ctx.join_aliases().len(), 3);
    assert!(sql.contains("ILIKE '%ana%'"), "{sql}");
    assert!(
        sql.contains(r#"ORDER BY "customer_address_country"."name" ASC"#),
        "{sql}"
    );
    assert!(!sql.contains(r#""orders"."id" DESC"#), "{sql}");
}

#[test]
fn repeated_sort_key_joins_once() {
    let registry = common::registry();
    let order = registry.get("order").unwrap();
    let request = ListingRequest::from_body(&json!({
        "sortBy": [
            {"key": "customer_id", "order": "asc"},
            {"key": "customer_id", "order": "desc"}
        ]
    }))
    .unwrap();

    let sql = compile(&registry, order, &request).unwrap().page_sql(10, 0);
    assert_eq!(sql.matches("LEFT JOIN").count(), 1, "{sql}");
}

#[test]
fn form_encoded_listing_body() {
    let registry = common::registry();
    let customer = registry.get("customer").unwrap();
    let request = ListingRequest::from_body(&json!({
        "itemsPerPage": "-1",
        "search": "{\"email\":\"example.com\"}",
        "deleted": "true"
    }))
    .unwrap();
    assert_eq!(request.page_size, PageSize::All);

    let ctx = compile(&registry, customer, &request).unwrap();
    let count = ctx.count_sql();
    assert!(count.contains(r#""customers"."deleted_at" IS NOT NULL"#), "{count}");
    assert!(count.contains("ILIKE '%example.com%'"), "{count}");
}

#[test]
fn unknown_keys_never_fail() {
    let registry = common::registry();
    let tag = registry.get("tag").unwrap();
    let request = ListingRequest::from_body(&json!({
        "search": {"colour": "red"},
        "sortBy": [{"key": "colour", "order": "asc"}]
    }))
    .unwrap();

    let ctx = compile(&registry, tag, &request).unwrap();
    assert_eq!(ctx.ignored_keys().len(), 2);
    assert_eq!(
        ctx.page_sql(5, 0),
        r#"SELECT row_to_json("tags") AS "row" FROM "tags" ORDER BY "tags"."id" DESC LIMIT 5 OFFSET 0"#
    );
}

#[test]
fn same_table_reached_by_two_paths_gets_distinct_aliases() {
    let registry = common::extended_registry();
    let order = registry.get("order").unwrap();
    let request = ListingRequest::from_body(&json!({
        "sortBy": [
            {"key": "ship_address_id", "order": "asc"},
            {"key": "customer_country", "order": "asc"}
        ]
    }))
    .unwrap();

    let sql = compile(&registry, order, &request).unwrap().page_sql(10, 0);
    assert_eq!(sql.matches("LEFT JOIN").count(), 4, "{sql}");
    assert_eq!(sql.matches(r#"AS "customer_address" "#).count(), 1, "{sql}");
    assert!(
        sql.contains(r#"ON "customer"."address_id" = "customer_address_2"."id""#),
        "{sql}"
    );
    assert!(
        sql.contains(r#"ORDER BY "customer_address"."street" ASC, "customer_address_country"."name" ASC"#),
        "{sql}"
    );
}

#[test]
fn polymorphic_keys_are_ignored() {
    let registry = common::extended_registry();
    let comment = registry.get("comment").unwrap();
    let request = ListingRequest::from_body(&json!({
        "search": {"commentable_id": "abc"},
        "sortBy": [{"key": "commentable_id", "order": "asc"}]
    }))
    .unwrap();

    let ctx = compile(&registry, comment, &request).unwrap();
    assert_eq!(ctx.ignored_keys(), ["commentable_id", "commentable_id"]);
    assert_eq!(
        ctx.page_sql(10, 0),
        r#"SELECT row_to_json("comments") AS "row" FROM "comments" ORDER BY "comments"."id" DESC LIMIT 10 OFFSET 0"#
    );
}
