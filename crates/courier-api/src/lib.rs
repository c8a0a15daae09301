//! # courier-api
//!
//! HTTP surface of the attachment engine: session, chunk, finalize, and
//! cancel endpoints plus token-gated downloads with byte-range support.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use extractors::{AppState, AuthenticatedUser};
pub use routes::router;
