//! Calendar projection of entities with a `calendar` declaration.

use std::sync::Arc;

use anyhow::Result;
use sea_query::{Alias, Cond, Expr, Order, PostgresQueryBuilder, Query};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;
use tracing::debug;

use crate::entity::{CalendarSpec, Entity, EntityRegistry, casts};
use crate::query::sql::{qualified, quote};
use crate::query::{EagerLoader, TrashScope};

const DEFAULT_CLASS: &str = "cell";

/// Visible window requested by the calendar widget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CalendarRequest {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

impl CalendarRequest {
    /// Both bounds, when both are present and non-blank.
    fn window(&self) -> Option<(&str, &str)> {
        let start = self.start.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let end = self.end.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some((start, end))
    }
}

/// One calendar entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarEvent {
    pub start: Value,
    pub end: Value,
    pub title: String,
    pub item: Value,
    pub class: String,
    pub drag: bool,
}

/// Rows with both bounds set, overlapping the window when one is given.
pub fn events_sql(entity: &Entity, spec: &CalendarSpec, request: &CalendarRequest) -> String {
    let table = entity.table();
    let column = |name: &str| Expr::col((Alias::new(table), Alias::new(name)));

    let mut select = Query::select();
    select
        .expr_as(
            Expr::cust(format!("row_to_json({})", quote(table))),
            Alias::new("row"),
        )
        .from(Alias::new(table))
        .and_where(column(&spec.start).is_not_null())
        .and_where(column(&spec.end).is_not_null())
        .order_by_expr(Expr::cust(qualified(table, "id")), Order::Asc);

    if let Some((start, end)) = request.window() {
        select.cond_where(
            Cond::any()
                .add(column(&spec.start).between(start, end))
                .add(column(&spec.end).between(start, end))
                .add(
                    Cond::all()
                        .add(column(&spec.start).lte(start))
                        .add(column(&spec.end).gte(end)),
                ),
        );
    }
    if let Some(condition) = TrashScope::Active.condition(entity, table) {
        select.and_where(condition);
    }
    select.to_string(PostgresQueryBuilder)
}

/// Turn loaded rows into events.
///
/// `raw` holds the rows before shaping so event bounds keep their storage
/// format; `shaped` is what the widget displays.
pub fn build_events(spec: &CalendarSpec, raw: &[Value], shaped: &[Value]) -> Vec<CalendarEvent> {
    let mut events = Vec::with_capacity(raw.len());
    for (row, item) in raw.iter().zip(shaped) {
        let title = spec.title.render(item);
        let bound = |key: &str| row.get(key).cloned().unwrap_or(Value::Null);

        if spec.separate_events {
            for (key, class) in [
                (&spec.start, spec.start_class.as_deref()),
                (&spec.end, spec.end_class.as_deref()),
            ] {
                events.push(CalendarEvent {
                    start: bound(key),
                    end: bound(key),
                    title: title.clone(),
                    item: item.clone(),
                    class: class.unwrap_or(DEFAULT_CLASS).to_string(),
                    drag: true,
                });
            }
        } else {
            events.push(CalendarEvent {
                start: bound(&spec.start),
                end: bound(&spec.end),
                title,
                item: item.clone(),
                class: DEFAULT_CLASS.to_string(),
                drag: true,
            });
        }
    }
    events
}

/// Loads calendar events.
#[derive(Clone)]
pub struct CalendarService {
    pool: PgPool,
    registry: Arc<EntityRegistry>,
}

impl CalendarService {
    pub fn new(pool: PgPool, registry: Arc<EntityRegistry>) -> Self {
        Self { pool, registry }
    }

    /// `{eventsData: {items: [...]}}`; entities without a calendar yield
    /// no events.
    pub async fn events(&self, entity: &Entity, request: &CalendarRequest) -> Result<Value> {
        let Some(spec) = &entity.definition().calendar else {
            return Ok(json!({ "eventsData": { "items": [] } }));
        };

        let sql = events_sql(entity, spec, request);
        let mut rows: Vec<Value> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        EagerLoader::new(&self.pool, &self.registry)
            .load(entity, &mut rows)
            .await?;
        let raw = rows.clone();
        casts::shape_rows(entity.definition(), &mut rows);

        let events = build_events(spec, &raw, &rows);
        debug!(entity = %entity.name(), rows = raw.len(), events = events.len(), "calendar events built");
        Ok(json!({ "eventsData": { "items": events } }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::shop_registry;

    fn order_calendar() -> (EntityRegistry, CalendarSpec) {
        let registry = shop_registry();
        let spec = registry
            .get("order")
            .unwrap()
            .definition()
            .calendar
            .clone()
            .unwrap();
        (registry, spec)
    }

    #[test]
    fn window_requires_both_bounds() {
        let request = CalendarRequest {
            start: Some("2024-01-01".into()),
            end: Some(" ".into()),
        };
        assert!(request.window().is_none());
        assert!(CalendarRequest::default().window().is_none());
    }

    #[test]
    fn sql_filters_null_bounds_and_overlap() {
        let (registry, spec) = order_calendar();
        let order = registry.get("order").unwrap();

        let sql = events_sql(order, &spec, &CalendarRequest::default());
        assert!(sql.contains(r#""orders"."placed_at" IS NOT NULL"#), "{sql}");
        assert!(sql.contains(r#""orders"."delivered_at" IS NOT NULL"#), "{sql}");
        assert!(!sql.contains("BETWEEN"), "{sql}");

        let request = CalendarRequest {
            start: Some("2024-01-01".into()),
            end: Some("2024-01-31".into()),
        };
        let sql = events_sql(order, &spec, &request);
        assert!(
            sql.contains(r#""orders"."placed_at" BETWEEN '2024-01-01' AND '2024-01-31'"#),
            "{sql}"
        );
        assert!(
            sql.contains(r#""orders"."delivered_at" BETWEEN '2024-01-01' AND '2024-01-31'"#),
            "{sql}"
        );
        assert!(sql.contains(r#""orders"."placed_at" <= '2024-01-01'"#), "{sql}");
        assert!(sql.contains(r#""orders"."delivered_at" >= '2024-01-31'"#), "{sql}");
        assert!(sql.contains(" OR "), "{sql}");
        assert!(sql.contains(r#""orders"."deleted_at" IS NULL"#), "{sql}");
    }

    #[test]
    fn builds_range_and_separate_events() {
        let (_, mut spec) = order_calendar();
        let raw = vec![json!({"id": 1, "code": "A1", "placed_at": "2024-01-02 10:00:00", "delivered_at": "2024-01-05 12:00:00"})];
        let shaped = vec![json!({"id": 1, "code": "A1", "placed_at": "02-01-2024 10:00", "delivered_at": "05-01-2024 12:00"})];

        spec.separate_events = false;
        let events = build_events(&spec, &raw, &shaped);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].start, json!("2024-01-02 10:00:00"));
        assert_eq!(events[0].end, json!("2024-01-05 12:00:00"));
        assert_eq!(events[0].class, "cell");
        assert!(events[0].drag);
        assert_eq!(events[0].item, shaped[0]);

        spec.separate_events = true;
        let events = build_events(&spec, &raw, &shaped);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].start, events[0].end);
        assert_eq!(events[0].class, "order-placed");
        assert_eq!(events[1].start, json!("2024-01-05 12:00:00"));
        assert_eq!(events[1].class, "order-delivered");
        assert_eq!(events[0].title, events[1].title);
    }
}
