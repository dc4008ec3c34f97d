//! HTTP error mapping.
//!
//! Every failure leaves the API as `{"code": ..., "message": ...}` with a
//! status derived from the error category.

use std::fmt;

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pairchat_core::{PairingError, RelayError};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthError, service::ServiceError};

/// Error body returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

/// API-level error.
#[derive(Debug)]
#[allow(missing_docs)]
pub enum ApiError {
    // Validation (400)
    InvalidInput { field: String, reason: String },
    InvalidUserId(String),

    // Authorization (401, 403)
    Unauthorized(String),
    Forbidden(String),

    // Not found (404)
    UserNotFound(String),
    RoomNotFound(String),

    // Conflict (409)
    NotEnoughUsers { available: usize },

    // Dependency and internal failures (500)
    StoreUnavailable(String),
    Internal(String),
}

impl ApiError {
    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::InvalidUserId(_) => "INVALID_USER_ID",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::RoomNotFound(_) => "ROOM_NOT_FOUND",
            Self::NotEnoughUsers { .. } => "NOT_ENOUGH_USERS",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput { .. } | Self::InvalidUserId(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::UserNotFound(_) | Self::RoomNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotEnoughUsers { .. } => StatusCode::CONFLICT,
            Self::StoreUnavailable(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human-readable message.
    pub fn message(&self) -> String {
        match self {
            Self::InvalidInput { field, reason } => {
                format!("Invalid input for field '{field}': {reason}")
            },
            Self::InvalidUserId(msg) => format!("Invalid user ID: {msg}"),
            Self::Unauthorized(msg) => format!("Unauthorized: {msg}"),
            Self::Forbidden(msg) => format!("Forbidden: {msg}"),
            Self::UserNotFound(id) => format!("User not found: {id}"),
            Self::RoomNotFound(id) => format!("Room not found: {id}"),
            Self::NotEnoughUsers { available } => {
                format!("Not enough unpaired users to create a room ({available} available)")
            },
            Self::StoreUnavailable(msg) => format!("Store unavailable: {msg}"),
            Self::Internal(msg) => format!("Internal error: {msg}"),
        }
    }

    /// Structured body.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse { code: self.code().to_string(), message: self.message() }
    }

    pub(crate) fn invalid(field: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidInput { field: field.to_string(), reason: reason.to_string() }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for ApiError {}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidUserId(msg) => Self::InvalidUserId(msg),
            ServiceError::InvalidInput { field, reason } => Self::invalid(field, reason),
            ServiceError::UserNotFound(id) => Self::UserNotFound(id.to_string()),
            ServiceError::RoomNotFound(id) => Self::RoomNotFound(id.to_string()),
            ServiceError::NotEnoughUsers { available } => Self::NotEnoughUsers { available },
            ServiceError::Auth(err) => err.into(),
            ServiceError::Store(err) => Self::StoreUnavailable(err.to_string()),
            ServiceError::Pairing(err @ PairingError::Store { .. }) => {
                Self::StoreUnavailable(err.to_string())
            },
            ServiceError::Relay(err @ RelayError::Store(_)) => {
                Self::StoreUnavailable(err.to_string())
            },
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken | AuthError::InvalidToken(_) => {
                Self::Unauthorized(err.to_string())
            },
            AuthError::Mismatch { .. } => Self::Forbidden(err.to_string()),
            AuthError::Unavailable(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid("body", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid("query", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self.message());
        } else {
            tracing::debug!(code = self.code(), "{}", self.message());
        }
        (status, Json(self.to_response())).into_response()
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use pairchat_core::{RoomId, StoreError, UserId};

    use super::*;

    #[test]
    fn codes_and_statuses() {
        let cases = [
            (ApiError::invalid("original_text", "blank"), "INVALID_INPUT", StatusCode::BAD_REQUEST),
            (ApiError::InvalidUserId("short".into()), "INVALID_USER_ID", StatusCode::BAD_REQUEST),
            (ApiError::Unauthorized("x".into()), "UNAUTHORIZED", StatusCode::UNAUTHORIZED),
            (ApiError::Forbidden("x".into()), "FORBIDDEN", StatusCode::FORBIDDEN),
            (ApiError::UserNotFound("u".into()), "USER_NOT_FOUND", StatusCode::NOT_FOUND),
            (ApiError::RoomNotFound("r".into()), "ROOM_NOT_FOUND", StatusCode::NOT_FOUND),
            (ApiError::NotEnoughUsers { available: 1 }, "NOT_ENOUGH_USERS", StatusCode::CONFLICT),
            (
                ApiError::StoreUnavailable("x".into()),
                "STORE_UNAVAILABLE",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::Internal("x".into()), "INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status_code(), status);
        }
    }

    #[test]
    fn service_errors_map_to_categories() {
        let err: ApiError = ServiceError::RoomNotFound(RoomId::from("room_x")).into();
        assert_eq!(err.code(), "ROOM_NOT_FOUND");
        assert!(err.message().contains("room_x"));

        let err: ApiError =
            ServiceError::Auth(AuthError::Mismatch { claimed: UserId::from("user1") }).into();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let err: ApiError = ServiceError::Store(StoreError::Unavailable("down".into())).into();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
    }
}
