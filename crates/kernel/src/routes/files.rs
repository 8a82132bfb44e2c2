//! Download routes for uploaded images and files.

use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::debug;

use crate::entity::Entity;
use crate::error::{AppError, AppResult};
use crate::file::{FileLocation, UploadKind, Visibility};
use crate::state::AppState;

/// Create the file download router.
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/files/{visibility}/{kind}/{entity}/{field}/{name}",
        get(download),
    )
}

/// Location of an upload field, provided the URL matches its declared
/// visibility and kind.
fn locate(
    entity: &Entity,
    visibility: &str,
    kind: &str,
    field: &str,
) -> Option<FileLocation> {
    let visibility = Visibility::parse(visibility)?;
    let kind = UploadKind::parse(kind)?;
    let descriptor = entity.definition().field(field)?;
    let location = FileLocation::for_field(entity.name(), descriptor)?;
    (location.visibility == visibility && location.kind == kind).then_some(location)
}

/// Single uploads are named by row id, multi-file uploads by
/// `{id}_{n}_{filename}`; either way one plain path segment.
fn is_plain_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// GET /files/{visibility}/{kind}/{entity}/{field}/{name}
async fn download(
    State(state): State<AppState>,
    Path((visibility, kind, entity, field, name)): Path<(String, String, String, String, String)>,
) -> AppResult<Response> {
    let entity = state.entity(&entity)?;
    let location = locate(entity, &visibility, &kind, &field).ok_or(AppError::NotFound)?;
    if !is_plain_segment(&name) {
        return Err(AppError::NotFound);
    }

    let path = location.single(&name);
    if !state.files().exists(&path).await.unwrap_or(false) {
        debug!(path = %path, "requested file does not exist");
        return Err(AppError::NotFound);
    }
    let file = state.files().read(&path).await?;

    let cache = match location.visibility {
        Visibility::Public => "public, max-age=3600",
        Visibility::Private => "private, no-store",
    };
    Ok((
        [(CONTENT_TYPE, file.mime_type), (CACHE_CONTROL, cache.to_string())],
        file.data,
    )
        .into_response())
}
