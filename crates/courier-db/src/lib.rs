//! # courier-db
//!
//! PostgreSQL-backed implementations of the attachment and upload-session
//! repositories, plus pool management. `schema.sql` at the crate root
//! holds the DDL.

pub mod attachments;
pub mod pool;
pub mod sessions;

pub use attachments::PgAttachmentRepo;
pub use pool::{Database, DatabaseConfig, PoolStats};
pub use sessions::PgSessionRepo;

use courier_attachments::RepositoryError;

pub(crate) fn backend(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        other => RepositoryError::Backend(other.to_string()),
    }
}
