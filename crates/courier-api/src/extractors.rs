//! Axum extractors and shared state.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use courier_attachments::{AttachmentError, AttachmentService, TokenError};
use courier_core::types::Id;

use crate::error::ApiError;

/// Application state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: AttachmentService,
}

impl AppState {
    pub fn new(service: AttachmentService) -> Self {
        Self { service }
    }
}

/// Caller identity. Authentication lives at the edge; the gateway verifies
/// credentials and forwards the numeric subject as a bearer value, which
/// is all this service needs.
pub struct AuthenticatedUser(pub Id);

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if let Some(subject) = header.strip_prefix("Bearer ") {
            if let Ok(id) = subject.trim().parse::<Id>() {
                return Ok(AuthenticatedUser(id));
            }
        }
        Err(ApiError::Attachment(AttachmentError::Token(
            TokenError::Invalid,
        )))
    }
}
