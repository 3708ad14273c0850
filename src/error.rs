// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// A frame the server could not act on. Reported back to the sender; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    InvalidFormat,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("{0}")]
    Validation(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "invalid_format",
            Self::UnknownType(_) => "unknown_type",
            Self::Validation(_) => "validation",
        }
    }
}

/// Failures of the chat message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("message store unavailable: {0}")]
    Unavailable(String),
    #[error("message store did not respond within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization token is required")]
    MissingCredential,
    #[error("invalid or expired token: {0}")]
    InvalidToken(String),
}

/// A socket write that failed or missed its deadline.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),
    #[error("write deadline exceeded")]
    WriteTimeout,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("ping period ({ping_secs}s) must be shorter than the pong wait ({pong_secs}s)")]
    Timing { ping_secs: u64, pong_secs: u64 },
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        // Store internals stay in the log.
        let message = match &self {
            Self::Store(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_codes() {
        assert_eq!(ProtocolError::InvalidFormat.code(), "invalid_format");
        assert_eq!(ProtocolError::UnknownType("x".into()).code(), "unknown_type");
        assert_eq!(ProtocolError::Validation("x".into()).code(), "validation");
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            AppError::BadRequest("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(AuthError::MissingCredential).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::NotFound("gone".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(StoreError::Unavailable("down".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn store_errors_are_not_leaked_to_clients() {
        let response =
            AppError::from(StoreError::Unavailable("password=hunter2".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "error": "internal server error" }));
    }
}
