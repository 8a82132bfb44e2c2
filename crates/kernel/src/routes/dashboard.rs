//! Entity routes under `/dashboard/{entity}`.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Map, Value};

use crate::crud::{CalendarRequest, FormPayload, MutationResponse};
use crate::entity::describe::describe;
use crate::error::{AppError, AppResult};
use crate::query::{ListingRequest, ListingResponse};
use crate::state::AppState;

/// Header carrying the authenticated user id, set by an upstream
/// authenticator.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Create the dashboard router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dashboard/{entity}", post(create_item))
        .route("/dashboard/{entity}/load-items", post(load_items))
        .route(
            "/dashboard/{entity}/load-calendar-events",
            post(load_calendar_events),
        )
        .route("/dashboard/{entity}/model", get(model))
        .route("/dashboard/{entity}/export-excel", get(export))
        .route("/dashboard/{entity}/{id}", get(get_item).post(update_item))
        .route("/dashboard/{entity}/{id}/destroy", post(destroy))
        .route("/dashboard/{entity}/{id}/permanent", post(destroy_permanent))
        .route("/dashboard/{entity}/{id}/restore", post(restore))
        .route(
            "/dashboard/{entity}/{id}/bind/{relation}/{item}",
            post(bind),
        )
        .route(
            "/dashboard/{entity}/{id}/unbind/{relation}/{item}",
            post(unbind),
        )
        .route(
            "/dashboard/{entity}/{id}/pivot/{relation}/{item}",
            post(update_pivot),
        )
}

/// Acting user for audit records.
pub fn actor(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Query string parameters overlaid by body values.
fn parameters(query: Vec<(String, String)>, body: &FormPayload) -> Value {
    let mut params: Map<String, Value> = query
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    params.extend(body.values().clone());
    Value::Object(params)
}

/// List rows with search, sort and pagination.
///
/// POST /dashboard/{entity}/load-items
async fn load_items(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    body: FormPayload,
) -> AppResult<Json<ListingResponse>> {
    let entity = state.entity(&entity)?;
    let request = ListingRequest::from_body(&parameters(query, &body))?;
    let table_data = state.listing().list(entity, &request).await?;
    Ok(Json(ListingResponse { table_data }))
}

/// POST /dashboard/{entity}/load-calendar-events
async fn load_calendar_events(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    body: FormPayload,
) -> AppResult<Json<Value>> {
    let entity = state.entity(&entity)?;
    let request: CalendarRequest = serde_json::from_value(parameters(query, &body))
        .map_err(|e| AppError::BadRequest(format!("invalid calendar window: {e}")))?;
    let events = state.calendar().events(entity, &request).await?;
    Ok(Json(events))
}

/// Form, table and relation metadata of an entity.
///
/// GET /dashboard/{entity}/model
async fn model(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> AppResult<Json<Value>> {
    let entity = state.entity(&entity)?;
    let custom = if entity.definition().custom_fields_enabled {
        state.custom_fields().active(entity.name()).await?
    } else {
        Vec::new()
    };
    Ok(Json(describe(entity, &custom)))
}

/// GET /dashboard/{entity}/export-excel
async fn export(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> AppResult<Json<Value>> {
    let entity = state.entity(&entity)?;
    Ok(Json(state.crud().export(entity).await?))
}

/// GET /dashboard/{entity}/{id}
async fn get_item(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let entity = state.entity(&entity)?;
    Ok(Json(state.crud().get_item(entity, &id).await?))
}

/// POST /dashboard/{entity}
async fn create_item(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    headers: HeaderMap,
    payload: FormPayload,
) -> AppResult<Json<MutationResponse>> {
    let entity = state.entity(&entity)?;
    let response = state
        .crud()
        .create(entity, &payload, actor(&headers))
        .await?;
    Ok(Json(response))
}

/// POST /dashboard/{entity}/{id}
async fn update_item(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
    payload: FormPayload,
) -> AppResult<Json<MutationResponse>> {
    let entity = state.entity(&entity)?;
    let response = state
        .crud()
        .update(entity, &id, &payload, actor(&headers))
        .await?;
    Ok(Json(response))
}

/// POST /dashboard/{entity}/{id}/destroy
async fn destroy(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<MutationResponse>> {
    let entity = state.entity(&entity)?;
    Ok(Json(state.crud().destroy(entity, &id, actor(&headers)).await?))
}

/// POST /dashboard/{entity}/{id}/permanent
async fn destroy_permanent(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<MutationResponse>> {
    let entity = state.entity(&entity)?;
    let response = state
        .crud()
        .destroy_permanent(entity, &id, actor(&headers))
        .await?;
    Ok(Json(response))
}

/// POST /dashboard/{entity}/{id}/restore
async fn restore(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<MutationResponse>> {
    let entity = state.entity(&entity)?;
    Ok(Json(state.crud().restore(entity, &id, actor(&headers)).await?))
}

/// POST /dashboard/{entity}/{id}/bind/{relation}/{item}
async fn bind(
    State(state): State<AppState>,
    Path((entity, id, relation, item)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    payload: FormPayload,
) -> AppResult<Json<MutationResponse>> {
    let entity = state.entity(&entity)?;
    let response = state
        .crud()
        .bind(entity, &id, &relation, &item, &payload, actor(&headers))
        .await?;
    Ok(Json(response))
}

/// POST /dashboard/{entity}/{id}/pivot/{relation}/{item}
async fn update_pivot(
    State(state): State<AppState>,
    Path((entity, id, relation, item)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    payload: FormPayload,
) -> AppResult<Json<MutationResponse>> {
    let entity = state.entity(&entity)?;
    let response = state
        .crud()
        .update_pivot(entity, &id, &relation, &item, &payload, actor(&headers))
        .await?;
    Ok(Json(response))
}

/// POST /dashboard/{entity}/{id}/unbind/{relation}/{item}
async fn unbind(
    State(state): State<AppState>,
    Path((entity, id, relation, item)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> AppResult<Json<MutationResponse>> {
    let entity = state.entity(&entity)?;
    let response = state
        .crud()
        .unbind(entity, &id, &relation, &item, actor(&headers))
        .await?;
    Ok(Json(response))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn reads_actor_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(actor(&headers), None);
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" 42 "));
        assert_eq!(actor(&headers), Some("42"));
        headers.insert(USER_ID_HEADER, HeaderValue::from_static(""));
        assert_eq!(actor(&headers), None);
    }

    #[test]
    fn body_overrides_query_parameters() {
        let body = FormPayload::from_json(json!({"page": 3, "deleted": true}));
        let params = parameters(
            vec![
                ("page".into(), "1".into()),
                ("itemsPerPage".into(), "25".into()),
            ],
            &body,
        );
        assert_eq!(params, json!({"page": 3, "itemsPerPage": "25", "deleted": true}));

        let request = ListingRequest::from_body(&params).unwrap();
        assert_eq!(request.page, 3);
        assert!(request.deleted);
    }
}
