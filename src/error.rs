//! Error kinds shared by the registry, the chat service and the HTTP layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::{Session, SessionStatus};

/// Failures raised by a session or message store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session already assigned to {}", .session.assigned_staff_name.as_deref().unwrap_or("another agent"))]
    AlreadyAssigned { session: Box<Session> },

    #[error("cannot {action} while session is {from}")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },

    #[error("session '{0}' is resolved")]
    SessionResolved(String),

    #[error("session is not assigned to you")]
    NotAssigned,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ChatError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ChatError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            ChatError::AlreadyAssigned { .. } => (StatusCode::CONFLICT, "ALREADY_ASSIGNED"),
            ChatError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            ChatError::SessionResolved(_) => (StatusCode::CONFLICT, "SESSION_RESOLVED"),
            ChatError::NotAssigned => (StatusCode::FORBIDDEN, "NOT_ASSIGNED"),
            ChatError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ChatError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ChatError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
            ChatError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        }
        let body = match &self {
            ChatError::AlreadyAssigned { session } => json!({
                "error": self.to_string(),
                "code": code,
                "session": session,
            }),
            _ => json!({ "error": self.to_string(), "code": code }),
        };
        (status, Json(body)).into_response()
    }
}
