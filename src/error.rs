//! Error types for the splitroom backend

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Result type for backend operations
pub type AppResult<T> = Result<T, AppError>;

/// Error types for the splitroom backend
#[derive(Debug, Error)]
pub enum AppError {
    /// Key/value store failure
    #[error("store error: {0}")]
    Store(String),

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Room does not exist in the store
    #[error("room not found")]
    RoomNotFound,

    /// Join token did not verify
    #[error("invalid join token")]
    InvalidToken,

    /// Client-supplied input was rejected
    #[error("{0}")]
    BadRequest(String),

    /// Upstream provider (vision model, FX feed) failure
    #[error("{0}")]
    Upstream(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<hmac::digest::InvalidLength> for AppError {
    fn from(err: hmac::digest::InvalidLength) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::RoomNotFound => StatusCode::NOT_FOUND,
            AppError::InvalidToken => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) | AppError::Upstream(_) => StatusCode::BAD_REQUEST,
            AppError::Store(_) | AppError::Serialization(_) | AppError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
