//! Crate-wide error type and its HTTP mapping.
//!
//! Every failure surfaced by the control API is one of these kinds. The
//! mapping to status codes is fixed:
//!
//! | Kind         | Status |
//! |--------------|--------|
//! | `Validation` | 400    |
//! | `NotFound`   | 404    |
//! | `Conflict`   | 409    |
//! | `Gone`       | 410    |
//! | `Exhausted`  | 503    |
//! | `Driver`     | 500    |
//! | `Timeout`    | 504    |
//! | `Internal`   | 500    |

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict on {0}")]
    Conflict(String),

    #[error("no free port in configured range")]
    Exhausted,

    #[error("container daemon error: {0}")]
    Driver(String),

    #[error("container no longer exists: {0}")]
    Gone(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(format!("database error: {e}"))
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match e {
            StoreError::Conflict { field } => ApiError::Conflict(field.to_string()),
            StoreError::NotFound => ApiError::NotFound("record".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_contract() {
        assert_eq!(
            ApiError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict("port".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Exhausted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::Gone("c".into()).status_code(), StatusCode::GONE);
        assert_eq!(
            ApiError::Timeout("inspect".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
