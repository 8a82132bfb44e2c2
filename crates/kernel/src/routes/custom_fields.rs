//! Custom field definition management.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crud::custom_fields::available_types;
use crate::crud::{CustomFieldDefinition, CustomFieldInput};
use crate::entity::Entity;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Create the custom fields router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/custom-fields/types", get(types))
        .route("/custom-fields/{entity}", get(list).post(create))
        .route("/custom-fields/{entity}/reorder", post(reorder))
        .route(
            "/custom-fields/{entity}/{id}",
            post(update).put(update).delete(destroy),
        )
        .route("/custom-fields/{entity}/{id}/destroy", post(destroy))
}

#[derive(Debug, Serialize)]
struct Message {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<CustomFieldDefinition>,
}

#[derive(Debug, Deserialize)]
struct ReorderRequest {
    order: Vec<i64>,
}

/// Entities accept custom fields only when they opt in.
fn enabled_entity<'a>(state: &'a AppState, name: &str) -> AppResult<&'a Entity> {
    let entity = state.entity(name)?;
    if entity.definition().custom_fields_enabled {
        Ok(entity)
    } else {
        Err(AppError::NotFound)
    }
}

/// GET /custom-fields/types
async fn types() -> Json<Value> {
    Json(available_types())
}

/// GET /custom-fields/{entity}
async fn list(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> AppResult<Json<Vec<CustomFieldDefinition>>> {
    let entity = enabled_entity(&state, &entity)?;
    Ok(Json(state.custom_fields().list(entity.name()).await?))
}

/// POST /custom-fields/{entity}
async fn create(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(input): Json<CustomFieldInput>,
) -> AppResult<Json<Message>> {
    let entity = enabled_entity(&state, &entity)?;
    let definition = state.custom_fields().create(entity.name(), input).await?;
    Ok(Json(Message {
        message: "Custom field created.",
        data: Some(definition),
    }))
}

/// POST /custom-fields/{entity}/{id}
async fn update(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, i64)>,
    Json(input): Json<CustomFieldInput>,
) -> AppResult<Json<Message>> {
    let entity = enabled_entity(&state, &entity)?;
    let definition = state
        .custom_fields()
        .update(entity.name(), id, input)
        .await?;
    Ok(Json(Message {
        message: "Custom field updated.",
        data: Some(definition),
    }))
}

/// DELETE /custom-fields/{entity}/{id}
async fn destroy(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, i64)>,
) -> AppResult<Json<Message>> {
    let entity = enabled_entity(&state, &entity)?;
    state.custom_fields().delete(entity.name(), id).await?;
    Ok(Json(Message {
        message: "Custom field deleted.",
        data: None,
    }))
}

/// POST /custom-fields/{entity}/reorder with `{"order": [ids...]}`
async fn reorder(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(request): Json<ReorderRequest>,
) -> AppResult<Json<Message>> {
    let entity = enabled_entity(&state, &entity)?;
    state
        .custom_fields()
        .reorder(entity.name(), &request.order)
        .await?;
    Ok(Json(Message {
        message: "Order updated.",
        data: None,
    }))
}
