use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Service-level error. Branch failures inside a request are handled as
/// values and never surface here; these are the kinds a caller can see.
#[derive(Error, Debug, Clone)]
pub enum RagError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("generator busy: {0}")]
    GeneratorBusy(String),

    #[error("generator failed: {0}")]
    GeneratorFailed(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("chunk store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    /// Stable machine-readable kind used in error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::AuthRequired(_) => "AuthRequired",
            Self::SourceUnavailable(_) => "SourceUnavailable",
            Self::GeneratorBusy(_) => "GeneratorBusy",
            Self::GeneratorFailed(_) => "GeneratorFailed",
            Self::DeadlineExceeded(_) => "DeadlineExceeded",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::Internal(_) => "Internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    request_id: String,
}

impl IntoResponse for RagError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (status, message) = match &self {
            RagError::InvalidRequest(msg) => {
                tracing::warn!(request_id = %request_id, "invalid request: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            RagError::AuthRequired(msg) => {
                tracing::warn!(request_id = %request_id, "auth required: {}", msg);
                (StatusCode::UNAUTHORIZED, msg.clone())
            }
            RagError::SourceUnavailable(msg) => {
                tracing::error!(request_id = %request_id, "source unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            RagError::GeneratorBusy(msg) => {
                tracing::warn!(request_id = %request_id, "generator busy: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            RagError::GeneratorFailed(msg) => {
                tracing::error!(request_id = %request_id, "generator failed: {}", msg);
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            RagError::DeadlineExceeded(msg) => {
                tracing::warn!(request_id = %request_id, "deadline exceeded: {}", msg);
                (StatusCode::GATEWAY_TIMEOUT, msg.clone())
            }
            RagError::StoreUnavailable(msg) => {
                tracing::error!(request_id = %request_id, "store unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            RagError::Internal(msg) => {
                tracing::error!(request_id = %request_id, "internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        let body = Json(ErrorResponse {
            error: self.kind(),
            message,
            request_id,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for RagError {
    fn from(err: anyhow::Error) -> Self {
        RagError::Internal(format!("{:#}", err))
    }
}
