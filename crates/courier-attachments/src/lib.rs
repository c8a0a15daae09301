//! # courier-attachments
//!
//! The attachment domain core: models and the lifecycle state machine,
//! repository seams, validation policy, capability tokens, thumbnail
//! derivation, the lifecycle/upload-session service, and the expiry
//! sweeper.

pub mod expiry;
pub mod model;
pub mod repo;
pub mod service;
pub mod thumbnail;
pub mod token;
pub mod validate;

pub use expiry::{ExpirySweeper, SweepStats};
pub use model::{
    Attachment, AttachmentSpec, AttachmentView, CreateSessionsRequest, CreateSessionsResponse,
    UploadChunkProgress, UploadSession, UploadSessionHandle,
};
pub use repo::{
    AttachmentRepo, MemoryAttachmentRepo, MemorySessionRepo, RepositoryError, RepositoryResult,
    SessionRepo,
};
pub use service::{
    AttachmentError, AttachmentResult, AttachmentService, DownloadStream, MESSAGE_MAX_LENGTH,
};
pub use thumbnail::{ThumbnailError, ThumbnailOutput};
pub use token::{AccessTokenService, TokenError, TokenPayload};
pub use validate::{ValidationError, Validator};
