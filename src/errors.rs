use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for every store, gateway and API operation.
///
/// All variants are recoverable: a failed operation is reported to the
/// caller (HTTP response or negative ack on the originating connection)
/// and never takes down the process or other conversations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed or oversized input. Reported to the caller only.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Conversation endpoints do not resolve to a valid (customer, business)
    /// pair. No state change has occurred.
    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    /// Authorization failure on a delete/read-scoped operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or unverifiable credential. On the persistent connection this
    /// rejects the upgrade itself rather than dropping individual events.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Storage conflict or unavailability. The gateway retries these a
    /// bounded number of times before surfacing a failure ack.
    #[error("transient store failure: {0}")]
    TransientStore(sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::InvalidParticipants(_) => "InvalidParticipants",
            Self::Forbidden(_) => "Forbidden",
            Self::NotFound(_) => "NotFound",
            Self::Unauthorized(_) => "Unauthorized",
            Self::TransientStore(_) => "TransientStoreFailure",
            Self::Io(_) => "IoError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::InvalidParticipants(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            other => Self::TransientStore(other),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.error_name(),
            "message": self.to_string(),
            "status_code": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
