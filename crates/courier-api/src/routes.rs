//! Route table.

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};

use crate::extractors::AppState;
use crate::handlers::attachments;

/// Largest accepted request body: one chunk plus multipart overhead.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/api/v1/attachments", attachments_router())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

fn attachments_router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(attachments::create_sessions))
        .route("/uploads/:upload_id", post(attachments::upload_chunk))
        .route("/uploads/:upload_id", delete(attachments::cancel_upload))
        .route("/uploads/:upload_id/finalize", post(attachments::finalize_upload))
        .route("/:id", get(attachments::download))
        .route("/:id/meta", get(attachments::get_metadata))
        .route("/:id/thumbnail", get(attachments::download_thumbnail))
}
