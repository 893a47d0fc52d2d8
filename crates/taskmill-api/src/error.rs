//! API error handling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<taskmill_db::DbError> for ApiError {
    fn from(err: taskmill_db::DbError) -> Self {
        match err {
            taskmill_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            taskmill_db::DbError::Duplicate(msg) => ApiError::Conflict(msg),
            taskmill_db::DbError::JobInactive(id) => {
                ApiError::Conflict(format!("job {id} is not active; activate it first"))
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<taskmill_core::Error> for ApiError {
    fn from(err: taskmill_core::Error) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}
