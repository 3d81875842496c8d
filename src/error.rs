//! Boundary error type: everything a handler can fail with, rendered as
//! `{"error": "<message>"}` with a matching status code.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::notify::NotifyError;
use crate::provider::GenerationError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or malformed request field.
    #[error("{0}")]
    Validation(String),

    /// A credential needed by this endpoint is not configured.
    #[error("{0}")]
    Configuration(String),

    /// The whole request outlived the server's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Notification(#[from] NotifyError),
}

impl AppError {
    pub fn missing_field(name: &str) -> Self {
        Self::Validation(format!("Missing field: {name}"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) | Self::Notification(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Generation(e) => e.status_code(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("❌ Request failed ({}): {}", status, self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}
