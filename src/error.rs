use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::llm::gemini::GeminiError;

/// User-visible error taxonomy. Internal pipeline failures (resolution,
/// ranking, reranking, per-image fetches) are recovered before reaching
/// this type and never surface to the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("invalid or missing credentials")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("insufficient credits: {required} required, {remaining} remaining")]
    InsufficientCredit { required: i64, remaining: i64 },
    #[error("the image model rejected the request; try a simpler prompt or fewer reference images")]
    PayloadRejected,
    #[error("the image generation service is temporarily unavailable; try again later")]
    ProviderUnavailable,
    #[error("the model returned no image")]
    NoImage,
    #[error("storage operation failed: {0}")]
    Storage(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::PayloadRejected => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NoImage => StatusCode::BAD_GATEWAY,
            ApiError::Storage(_) | ApiError::Database(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {:#}", self);
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<GeminiError> for ApiError {
    fn from(err: GeminiError) -> Self {
        match err {
            GeminiError::InvalidArgument(_) => ApiError::PayloadRejected,
            GeminiError::Unavailable(_) => ApiError::ProviderUnavailable,
            GeminiError::NoImage => ApiError::NoImage,
            GeminiError::Other(inner) => ApiError::Internal(inner),
        }
    }
}
