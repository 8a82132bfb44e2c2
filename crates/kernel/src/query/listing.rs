//! Listing orchestration: request parsing, statement compilation,
//! pagination and eager loading.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};

use super::context::{QueryContext, SortDirection, TrashScope};
use super::eager::EagerLoader;
use super::resolver::{Purpose, resolve};
use super::search::apply_search;
use super::sort::{apply_default_order, apply_sort};
use crate::entity::{ConfigurationError, Entity, EntityRegistry, casts};

const DEFAULT_ITEMS_PER_PAGE: i64 = 10;

/// A malformed listing parameter.
#[derive(Debug, Error)]
#[error("invalid listing parameter '{param}': {reason}")]
pub struct InvalidListingParam {
    pub param: &'static str,
    pub reason: String,
}

impl InvalidListingParam {
    fn new(param: &'static str, reason: impl Into<String>) -> Self {
        Self {
            param,
            reason: reason.into(),
        }
    }
}

/// Requested page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// `-1`: every row on a single page.
    All,
    Items(u64),
}

/// One `sortBy` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub key: String,
    pub order: SortDirection,
}

/// Parsed listing request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRequest {
    pub page_size: PageSize,
    pub page: u64,
    pub sort_by: Vec<SortKey>,
    pub search: Map<String, Value>,
    pub deleted: bool,
}

impl Default for ListingRequest {
    fn default() -> Self {
        Self {
            page_size: PageSize::Items(DEFAULT_ITEMS_PER_PAGE as u64),
            page: 1,
            sort_by: Vec::new(),
            search: Map::new(),
            deleted: false,
        }
    }
}

impl ListingRequest {
    /// Parse the body of a `load-items` call.
    ///
    /// `sortBy` and `search` may arrive as JSON-encoded strings (form
    /// submissions) or as plain JSON values.
    pub fn from_body(body: &Value) -> Result<Self, InvalidListingParam> {
        let get = |name: &str| body.get(name).filter(|v| !v.is_null());

        let page_size = match get("itemsPerPage") {
            None => PageSize::Items(DEFAULT_ITEMS_PER_PAGE as u64),
            Some(raw) => match as_integer(raw) {
                Some(-1) => PageSize::All,
                Some(n) if n >= 1 => PageSize::Items(n as u64),
                _ => {
                    return Err(InvalidListingParam::new(
                        "itemsPerPage",
                        "expected a positive integer or -1",
                    ));
                }
            },
        };

        let page = match get("page") {
            None => 1,
            Some(raw) => {
                let n = as_integer(raw)
                    .ok_or_else(|| InvalidListingParam::new("page", "expected an integer"))?;
                n.max(1) as u64
            }
        };

        let sort_by = match get("sortBy").map(decode) {
            None => Vec::new(),
            Some(Value::Array(entries)) => parse_sort_keys(&entries)?,
            Some(_) => return Err(InvalidListingParam::new("sortBy", "expected an array")),
        };

        let search = match get("search").map(decode) {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(Value::Array(list)) if list.is_empty() => Map::new(),
            Some(_) => return Err(InvalidListingParam::new("search", "expected an object")),
        };

        let deleted = get("deleted").map(as_flag).unwrap_or(false);

        Ok(Self {
            page_size,
            page,
            sort_by,
            search,
            deleted,
        })
    }

    /// Non-blank search terms, as trimmed text.
    pub fn search_terms(&self) -> impl Iterator<Item = (&str, String)> {
        self.search.iter().filter_map(|(key, value)| {
            let term = match value {
                Value::Null => return None,
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            (!term.is_empty()).then(|| (key.as_str(), term))
        })
    }
}

fn decode(raw: &Value) -> Value {
    match raw {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| raw.clone()),
        other => other.clone(),
    }
}

fn as_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_flag(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "on" | "yes"
        ),
        _ => false,
    }
}

/// Entries without both `key` and `order` are skipped; an unknown
/// direction is rejected.
fn parse_sort_keys(entries: &[Value]) -> Result<Vec<SortKey>, InvalidListingParam> {
    let mut keys = Vec::new();
    for entry in entries {
        let (Some(key), Some(order)) = (
            entry.get("key").and_then(Value::as_str),
            entry.get("order").and_then(Value::as_str),
        ) else {
            continue;
        };
        let order = SortDirection::parse(order).ok_or_else(|| {
            InvalidListingParam::new("sortBy", format!("unknown direction '{order}'"))
        })?;
        keys.push(SortKey {
            key: key.to_string(),
            order,
        });
    }
    Ok(keys)
}

/// Build the filtered, ordered statement for a listing request.
pub fn compile<'a>(
    registry: &'a EntityRegistry,
    entity: &'a Entity,
    request: &ListingRequest,
) -> Result<QueryContext<'a>, ConfigurationError> {
    let mut ctx = QueryContext::new(registry, entity);

    if let Some(condition) =
        TrashScope::for_listing(entity, request.deleted).condition(entity, entity.table())
    {
        ctx.and_where(condition);
    }

    for (key, term) in request.search_terms() {
        match resolve(entity, key, Purpose::Search) {
            Some(resolution) => apply_search(&mut ctx, &resolution, &term)?,
            None => ctx.ignore_key(key, "search"),
        }
    }

    for sort in &request.sort_by {
        match resolve(entity, &sort.key, Purpose::Order) {
            Some(resolution) => apply_sort(&mut ctx, &resolution, sort.order)?,
            None => ctx.ignore_key(&sort.key, "sort"),
        }
    }

    if !ctx.has_orders() {
        apply_default_order(&mut ctx);
    }

    Ok(ctx)
}

/// Effective `(items per page, page)` for a total row count.
pub fn page_window(total: u64, size: PageSize, page: u64, max_items_per_page: u64) -> (u64, u64) {
    match size {
        PageSize::All => (total, 1),
        PageSize::Items(n) if n > max_items_per_page => {
            warn!(
                requested = n,
                max = max_items_per_page,
                "itemsPerPage capped"
            );
            (max_items_per_page, page.max(1))
        }
        PageSize::Items(n) => (n, page.max(1)),
    }
}

/// Body of a listing response, under `tableData`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableData {
    pub items: Vec<Value>,
    pub items_length: u64,
    pub items_per_page: u64,
    pub page: u64,
    pub sort_by: Vec<SortKey>,
    pub search: Map<String, Value>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingResponse {
    pub table_data: TableData,
}

/// Runs listing requests against the database.
pub struct ListingService {
    pool: PgPool,
    registry: Arc<EntityRegistry>,
    max_items_per_page: u64,
}

impl ListingService {
    pub fn new(pool: PgPool, registry: Arc<EntityRegistry>, max_items_per_page: u64) -> Self {
        Self {
            pool,
            registry,
            max_items_per_page,
        }
    }

    /// One count query, one page query, then eager loading.
    pub async fn list(&self, entity: &Entity, request: &ListingRequest) -> Result<TableData> {
        let ctx = compile(&self.registry, entity, request)?;

        let count_sql = ctx.count_sql();
        debug!(entity = %entity.name(), sql = %count_sql, "listing count");
        let total: i64 = sqlx::query_scalar(&count_sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count {} rows", entity.name()))?;
        let total = total.max(0) as u64;

        let (per_page, page) =
            page_window(total, request.page_size, request.page, self.max_items_per_page);

        let mut items: Vec<Value> = if total == 0 || per_page == 0 {
            Vec::new()
        } else {
            let page_sql = ctx.page_sql(per_page, (page - 1).saturating_mul(per_page));
            debug!(entity = %entity.name(), sql = %page_sql, "listing page");
            sqlx::query_scalar(&page_sql)
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("failed to load {} rows", entity.name()))?
        };

        EagerLoader::new(&self.pool, &self.registry)
            .load(entity, &mut items)
            .await?;
        casts::shape_rows(entity.definition(), &mut items);

        Ok(TableData {
            items,
            items_length: total,
            items_per_page: per_page,
            page,
            sort_by: request.sort_by.clone(),
            search: request.search.clone(),
            deleted: request.deleted,
        })
    }
}
