//! # courier-storage
//!
//! Filesystem blob storage for message attachments, split into four
//! namespaces: temp (in-progress uploads), permanent (finalized blobs),
//! quarantine (infected artifacts retained for investigation), and
//! thumbnail (derived previews). Pure I/O, no lifecycle policy.

pub mod assemble;
pub mod store;

pub use store::{sanitize_filename, sha256_hex, BlobStore, StorageError, StorageResult};
