//! # courier-core
//!
//! Shared types, configuration, and collaborator traits for the Courier
//! attachment engine.
//!
//! The attachment subsystem treats user accounts, messages, and the
//! realtime transport as external collaborators; their narrow interfaces
//! live here so the domain crates depend only on traits.

pub mod config;
pub mod events;
pub mod types;

pub use config::{AppConfig, AttachmentLimits, ScannerConfig, ServerConfig, StorageConfig, TokenConfig};
pub use events::{
    MemoryDirectory, MemoryMessageGateway, MemoryPublisher, MessageGateway, MessageRef,
    UpdatePublisher, UserDirectory,
};
pub use types::{AttachmentStatus, AttachmentType, Id};
