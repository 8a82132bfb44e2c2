//! HTTP route handlers.

pub mod custom_fields;
pub mod dashboard;
pub mod files;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Every route of the engine, bound to `state`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(dashboard::router())
        .merge(custom_fields::router())
        .merge(files::router())
        .with_state(state)
}
