//! Service-level error taxonomy.
//!
//! Each component has its own error enum; they all convert into
//! [`ChatError`] at the messenger boundary, which is what the HTTP and
//! WebSocket layers report to clients.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use duet_proto::api::ErrorBody;
use duet_proto::message::ConversationId;
use duet_proto::stream::{Notice, NoticeCode};

use crate::directory::DirectoryError;
use crate::durable::StoreError;
use crate::hot_cache::CacheError;
use crate::sessions::SessionError;

/// Errors reported by the messaging core.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Unknown conversation, user, or message window.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller is not a participant of the conversation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No authorized session exists for the conversation.
    #[error("chat session not found for conversation {0}")]
    SessionNotFound(ConversationId),

    /// Conversation creation referenced a user that does not exist.
    #[error("referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    /// The request is well-formed but not allowed (e.g. chatting with yourself).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Message content exceeds the configured size limit.
    #[error("content too large: {size} bytes (max {max})")]
    ContentTooLarge {
        /// Size of the rejected content in bytes.
        size: usize,
        /// Configured limit in bytes.
        max: usize,
    },

    /// A store or cache is temporarily unavailable; the request may be retried.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Returns `true` if retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable machine-readable code for the error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::SessionNotFound(_) => "session_not_found",
            Self::ReferentialIntegrity(_) => "referential_integrity",
            Self::PermissionDenied(_) => "permission_denied",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ContentTooLarge { .. } => "content_too_large",
            Self::Transient(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status used when the error is returned from an endpoint.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ReferentialIntegrity(_) => StatusCode::CONFLICT,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::ContentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Notice frame sent on a conversation stream before it is closed.
    #[must_use]
    pub fn to_notice(&self) -> Notice {
        match self {
            Self::SessionNotFound(_) => {
                Notice::new(NoticeCode::SessionNotFound, "Chat session not found")
            }
            Self::Unauthorized(_) => Notice::new(NoticeCode::Unauthorized, "Unauthorized"),
            Self::ContentTooLarge { .. } => {
                Notice::new(NoticeCode::ContentTooLarge, self.to_string())
            }
            other => Notice::new(NoticeCode::Internal, other.to_string()),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => Self::Transient(reason),
            StoreError::Corrupt(reason) => Self::Internal(reason),
        }
    }
}

impl From<CacheError> for ChatError {
    fn from(err: CacheError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<SessionError> for ChatError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => Self::SessionNotFound(id),
            SessionError::Unauthorized { .. } => Self::Unauthorized(err.to_string()),
        }
    }
}

impl From<DirectoryError> for ChatError {
    fn from(err: DirectoryError) -> Self {
        Self::Transient(err.to_string())
    }
}
