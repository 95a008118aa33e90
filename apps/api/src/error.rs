//! HTTP error envelope. Every failure leaves the service as
//! `{error, message, code}` with the matching status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ledgerlog_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Dependency(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Dependency(_) => "dependency_unavailable",
            ApiError::Timeout(_) => "timeout",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => ApiError::Conflict(format!("record {id} already exists")),
            StoreError::NotFound => ApiError::NotFound("resource not found".into()),
            StoreError::Timeout(d) => {
                ApiError::Timeout(format!("store operation exceeded {d:?}"))
            }
            e @ StoreError::TagMismatch { .. } => ApiError::Internal(e.to_string()),
            e @ StoreError::Corrupt(_) => ApiError::Internal(e.to_string()),
            StoreError::Database(e) => {
                let wrapped = StoreError::Database(e);
                if wrapped.is_retriable() {
                    ApiError::Dependency(wrapped.to_string())
                } else {
                    ApiError::Internal(wrapped.to_string())
                }
            }
        }
    }
}
