//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use helpline_shared::events::ErrorBody;
use helpline_shared::StorageError;
use serde_json::json;

use crate::auth::AuthError;
use crate::websocket::registry::RegistryError;

/// Coarse error category, stable across variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Expired,
    Unavailable,
    Validation,
    Internal,
}

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Only the sender can recall a message")]
    NotOwner,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Resource errors
    #[error("Not found: {0}")]
    NotFound(&'static str),
    #[error("Connection is not registered, reconnect required")]
    ReconnectRequired,
    #[error("Could not determine the message recipient")]
    RecipientUnresolved,
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Session already assigned to another agent")]
    AlreadyAssigned,
    #[error("Recall window has passed")]
    Expired,
    #[error("Session is closed or missing")]
    SessionUnavailable,

    // Internal errors
    #[error("Storage unavailable")]
    StorageUnavailable,
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Unauthorized => ErrorKind::Unauthorized,
            ApiError::Forbidden | ApiError::NotOwner => ErrorKind::Forbidden,
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::NotFound(_) | ApiError::ReconnectRequired | ApiError::RecipientUnresolved => {
                ErrorKind::NotFound
            }
            ApiError::AlreadyExists(_) | ApiError::AlreadyAssigned => ErrorKind::Conflict,
            ApiError::Expired => ErrorKind::Expired,
            ApiError::SessionUnavailable | ApiError::StorageUnavailable => ErrorKind::Unavailable,
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::NotOwner => "NOT_OWNER",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::ReconnectRequired => "RECONNECT_REQUIRED",
            ApiError::RecipientUnresolved => "RECIPIENT_UNRESOLVED",
            ApiError::AlreadyExists(_) => "ALREADY_EXISTS",
            ApiError::AlreadyAssigned => "ALREADY_ASSIGNED",
            ApiError::Expired => "RECALL_EXPIRED",
            ApiError::SessionUnavailable => "SESSION_UNAVAILABLE",
            ApiError::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Expired => StatusCode::GONE,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body for WebSocket replies. Internal details are not exposed.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code().to_string(),
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ErrorBody { code, message } = self.to_body();
        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (self.status(), body).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => ApiError::NotFound(what),
            StorageError::Conflict(msg) => ApiError::AlreadyExists(msg),
            StorageError::Unavailable(msg) => {
                tracing::warn!(error = %msg, "Storage unavailable");
                ApiError::StorageUnavailable
            }
            StorageError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::StorageUnavailable
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyExists(id) => {
                ApiError::AlreadyExists(format!("connection {} is owned by another user", id))
            }
            RegistryError::NotFound(_) => ApiError::ReconnectRequired,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        tracing::debug!(error = %err, "Token rejected");
        ApiError::Unauthorized
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
