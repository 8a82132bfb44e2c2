//! Application error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::crud::ValidationErrors;
use crate::entity::ConfigurationError;
use crate::query::InvalidListingParam;

/// Application errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("the given data was invalid")]
    Validation(ValidationErrors),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("database error")]
    Database(#[from] sqlx::Error),
}

impl From<InvalidListingParam> for AppError {
    fn from(err: InvalidListingParam) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<ValidationErrors> for AppError {
    fn from(errors: ValidationErrors) -> Self {
        AppError::Validation(errors)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Server-side failures are logged in full and reported vaguely.
        let body = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = ?e, "internal server error");
                json!({ "message": "internal server error" })
            }
            AppError::Configuration(e) => {
                tracing::error!(error = %e, "entity configuration error");
                json!({ "message": "internal server error" })
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                json!({ "message": "internal server error" })
            }
            AppError::Validation(errors) => json!({
                "message": self.to_string(),
                "errors": errors,
            }),
            _ => json!({ "message": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;
