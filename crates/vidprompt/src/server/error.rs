//! API error type with JSON `{"error": "..."}` responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use consensus::PipelineError;
use serde::Serialize;

/// Response body for every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Route-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found")]
    NotFound,
    /// `public` is what the client sees; `detail` only goes to the log.
    #[error("Internal error: {detail}")]
    Internal { detail: String, public: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Internal failure whose detail is shown outside production only.
    pub fn internal(detail: impl Into<String>, fallback: &str, production: bool) -> Self {
        let detail = detail.into();
        let public = if production {
            fallback.to_string()
        } else {
            detail.clone()
        };
        Self::Internal { detail, public }
    }

    /// Map a pipeline failure: bad inputs are the caller's fault, the rest is ours.
    pub fn from_pipeline(err: PipelineError, fallback: &str, production: bool) -> Self {
        if err.is_client_error() {
            Self::BadRequest(err.to_string())
        } else {
            Self::internal(err.to_string(), fallback, production)
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::BadRequest(message) => message,
            Self::NotFound => "Not found".to_string(),
            Self::Internal { detail, public } => {
                tracing::error!(detail, "API internal error");
                public
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
