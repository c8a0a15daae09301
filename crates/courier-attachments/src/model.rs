//! Attachment and upload-session models.

use chrono::{DateTime, Utc};
use courier_core::types::{AttachmentStatus, AttachmentType, Id};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single uploaded file attached to a chat message. Owns its own
/// lifecycle independent of the message's existence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Database id, assigned on create.
    pub id: Option<Id>,
    /// Opaque identifier exposed to clients.
    pub public_id: String,
    /// Owning message, by id only.
    pub message_id: Id,
    pub kind: AttachmentType,
    pub mime_type: String,
    pub size_bytes: i64,
    /// Hex SHA-256 over the assembled bytes. Immutable once finalized.
    pub checksum: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration_seconds: Option<i32>,
    /// Plain-text description, at most 200 chars, no markup.
    pub alt_text: Option<String>,
    pub original_filename: Option<String>,
    /// Key of the permanent blob.
    pub storage_key: String,
    /// Set only once the attachment has reached READY at least once.
    pub thumbnail_key: Option<String>,
    pub status: AttachmentStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Attachment {
    pub fn new(
        message_id: Id,
        kind: AttachmentType,
        mime_type: impl Into<String>,
        size_bytes: i64,
        storage_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            public_id: Uuid::new_v4().to_string(),
            message_id,
            kind,
            mime_type: mime_type.into(),
            size_bytes,
            checksum: None,
            width: None,
            height: None,
            duration_seconds: None,
            alt_text: None,
            original_filename: None,
            storage_key: storage_key.into(),
            thumbnail_key: None,
            status: AttachmentStatus::Uploading,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == AttachmentType::Image
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at < now).unwrap_or(false)
    }

    /// Apply a lifecycle transition, refusing anything the state machine
    /// does not allow.
    pub fn transition(&mut self, next: AttachmentStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// The short-lived, resumable-by-chunk handle for one attachment's bytes.
/// At most one live (non-completed) session exists per attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Opaque, client-visible id.
    pub id: String,
    pub attachment_id: Id,
    pub owner_id: Id,
    pub expected_bytes: i64,
    pub total_chunks: u32,
    /// High-water mark; chunk re-delivery never regresses it.
    pub uploaded_chunks: u32,
    pub temp_key: String,
    /// Dead once true. The row is retained.
    pub completed: bool,
    pub last_error: Option<String>,
    /// FAILED-attachment resurrections consumed so far.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(attachment_id: Id, owner_id: Id, expected_bytes: i64, temp_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            attachment_id,
            owner_id,
            expected_bytes,
            total_chunks: 1,
            uploaded_chunks: 0,
            temp_key: temp_key.into(),
            completed: false,
            last_error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_chunk(&mut self, chunk_index: u32, total_chunks: u32) {
        self.total_chunks = total_chunks;
        self.uploaded_chunks = self.uploaded_chunks.max(chunk_index + 1).min(total_chunks);
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, error: Option<&str>) {
        self.completed = true;
        self.last_error = error.map(str::to_string);
        self.updated_at = Utc::now();
    }
}

/// Per-file metadata declared by the client at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSpec {
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
    #[serde(default)]
    pub duration_seconds: Option<i32>,
    #[serde(default)]
    pub alt_text: Option<String>,
}

/// Body of `POST /attachments/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionsRequest {
    pub recipient_username: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub expires_in_seconds: Option<i64>,
    pub attachments: Vec<AttachmentSpec>,
}

/// Per-file handle returned from session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionHandle {
    pub upload_id: String,
    pub attachment_id: Id,
    pub upload_url: String,
    pub finalize_url: String,
    pub chunk_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionsResponse {
    pub message_id: Id,
    pub uploads: Vec<UploadSessionHandle>,
}

/// Progress snapshot returned from each chunk upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkProgress {
    pub upload_id: String,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
}

/// Public view of an attachment. Download and thumbnail URLs are present
/// only once the attachment is READY and unexpired.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    pub id: Id,
    pub public_id: String,
    #[serde(rename = "type")]
    pub kind: AttachmentType,
    pub mime_type: String,
    pub size_bytes: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration_seconds: Option<i32>,
    pub alt_text: Option<String>,
    pub file_name: Option<String>,
    pub status: AttachmentStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
    pub thumbnail_url: Option<String>,
}
