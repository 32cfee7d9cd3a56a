//! Request-level error taxonomy.
//!
//! Errors are classified by who must act:
//! - Validation / NotFound / Conflict: the client sent something wrong
//! - MissingRelation: the store schema is behind (degraded deploy)
//! - UpstreamTimeout / Upstream: a provider call failed after fallback
//! - Internal: everything else
//!
//! Cross-owner access is reported as NotFound, never Forbidden, so the
//! surface leaks nothing about other owners' data.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::db::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Missing relation: {0}")]
    MissingRelation(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::MissingRelation(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout(_) | Self::Upstream(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingRelation { name } | StoreError::MissingColumn { name } => {
                Self::MissingRelation(name)
            }
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::MissingRelation(name) => json!({
                "error": "Service degraded",
                "note": format!("missing relation: {name}"),
            }),
            ApiError::Internal(detail) => json!({
                "error": "Internal error",
                "detail": detail,
            }),
            other => json!({ "error": other.to_string() }),
        };

        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }

        (status, Json(body)).into_response()
    }
}
