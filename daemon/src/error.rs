use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use seedalchemy_core::GenerationError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,

    #[error("Another generation is already running")]
    Busy,

    #[error("Internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Generation(GenerationError::Configuration(_)) => StatusCode::BAD_REQUEST,
            ApiError::Generation(GenerationError::Resource(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Generation(err) => err.kind(),
            ApiError::BadRequest(_) => "invalid_request_error",
            ApiError::NotFound => "not_found",
            ApiError::Busy => "busy",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.kind().to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
