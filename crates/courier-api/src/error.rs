//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_attachments::{AttachmentError, ValidationError};
use serde::Serialize;

/// API error: an attachment-domain error plus anything HTTP-specific.
#[derive(Debug)]
pub enum ApiError {
    Attachment(AttachmentError),
    BadRequest(String),
    RangeNotSatisfiable { size_bytes: u64 },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<AttachmentError> for ApiError {
    fn from(err: AttachmentError) -> Self {
        ApiError::Attachment(err)
    }
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Attachment(err) => match err {
                AttachmentError::Validation(ValidationError::TooManyPending) => {
                    StatusCode::TOO_MANY_REQUESTS
                }
                AttachmentError::Validation(_)
                | AttachmentError::SelfRecipient
                | AttachmentError::ContentTooLong
                | AttachmentError::InvalidExpiry(_)
                | AttachmentError::InvalidChunk { .. }
                | AttachmentError::MissingChunk(_)
                | AttachmentError::RetriesExhausted => StatusCode::BAD_REQUEST,
                AttachmentError::RecipientNotFound(_)
                | AttachmentError::NotFound
                | AttachmentError::SessionNotFound => StatusCode::NOT_FOUND,
                AttachmentError::SessionClosed | AttachmentError::InvalidState => {
                    StatusCode::CONFLICT
                }
                AttachmentError::Expired => StatusCode::GONE,
                AttachmentError::Forbidden => StatusCode::FORBIDDEN,
                AttachmentError::Token(_) => StatusCode::UNAUTHORIZED,
                AttachmentError::Storage(_)
                | AttachmentError::Repository(_)
                | AttachmentError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self, "Internal error");
        }
        match self {
            ApiError::RangeNotSatisfiable { size_bytes } => (
                status,
                [(axum::http::header::CONTENT_RANGE, format!("bytes */{size_bytes}"))],
                Json(ErrorBody {
                    error: "RangeNotSatisfiable".into(),
                    message: "Requested range cannot be satisfied".into(),
                }),
            )
                .into_response(),
            ApiError::Attachment(err) => {
                // internals stay internal; clients get a generic message
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "Internal server error".to_string()
                } else {
                    err.to_string()
                };
                (
                    status,
                    Json(ErrorBody {
                        error: status
                            .canonical_reason()
                            .unwrap_or("Error")
                            .replace(' ', ""),
                        message,
                    }),
                )
                    .into_response()
            }
            ApiError::BadRequest(message) => (
                status,
                Json(ErrorBody {
                    error: "BadRequest".into(),
                    message,
                }),
            )
                .into_response(),
        }
    }
}
