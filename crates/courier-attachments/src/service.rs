//! Attachment lifecycle service.
//!
//! Owns the upload-session flow (create, chunk, finalize, cancel), the
//! post-processing pipeline (scan, thumbnail, publish), and read-side
//! access checks. Transitions are always written through the repository
//! before any observable side effect is published.

use std::sync::Arc;

use chrono::{Duration, Utc};
use courier_core::config::AttachmentLimits;
use courier_core::events::{GatewayError, MessageGateway, UpdatePublisher, UserDirectory};
use courier_core::types::{AttachmentStatus, Id};
use courier_scan::{ScanStatus, VirusScanner};
use courier_storage::{sha256_hex, BlobStore, StorageError};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::model::{
    Attachment, AttachmentView, CreateSessionsRequest, CreateSessionsResponse, UploadChunkProgress,
    UploadSession, UploadSessionHandle,
};
use crate::repo::{AttachmentRepo, RepositoryError, SessionRepo};
use crate::thumbnail;
use crate::token::{AccessTokenService, TokenError};
use crate::validate::{ValidationError, Validator};

/// Ceiling on the text content accompanying an attachment batch.
pub const MESSAGE_MAX_LENGTH: usize = 2000;

/// Bytes sniffed from the head of an assembled file for type detection.
const SNIFF_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),
    #[error("Cannot send a message to yourself")]
    SelfRecipient,
    #[error("Message content must be {MESSAGE_MAX_LENGTH} characters or less.")]
    ContentTooLong,
    #[error("expiresInSeconds must be positive and at most {0} seconds.")]
    InvalidExpiry(i64),
    #[error("Attachment not found")]
    NotFound,
    #[error("Upload session not found")]
    SessionNotFound,
    #[error("Upload session is closed")]
    SessionClosed,
    #[error("Invalid chunk index {index} for {total} chunks")]
    InvalidChunk { index: u32, total: u32 },
    #[error("Chunk {0} was never uploaded")]
    MissingChunk(u32),
    #[error("Upload retry limit reached")]
    RetriesExhausted,
    #[error("Attachment is not in a state that allows this operation")]
    InvalidState,
    #[error("Attachment has expired")]
    Expired,
    #[error("Access denied")]
    Forbidden,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<StorageError> for AttachmentError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::MissingChunk(index) => AttachmentError::MissingChunk(index),
            other => AttachmentError::Storage(other),
        }
    }
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// An open download: the file handle plus the headers the caller needs.
#[derive(Debug)]
pub struct DownloadStream {
    pub attachment_id: Id,
    pub file: tokio::fs::File,
    pub size_bytes: u64,
    pub mime_type: String,
    pub file_name: Option<String>,
}

#[derive(Clone)]
pub struct AttachmentService {
    attachments: Arc<dyn AttachmentRepo>,
    sessions: Arc<dyn SessionRepo>,
    store: BlobStore,
    scanner: Arc<dyn VirusScanner>,
    directory: Arc<dyn UserDirectory>,
    gateway: Arc<dyn MessageGateway>,
    publisher: Arc<dyn UpdatePublisher>,
    validator: Validator,
    tokens: AccessTokenService,
    limits: AttachmentLimits,
    base_url: String,
}

impl AttachmentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        attachments: Arc<dyn AttachmentRepo>,
        sessions: Arc<dyn SessionRepo>,
        store: BlobStore,
        scanner: Arc<dyn VirusScanner>,
        directory: Arc<dyn UserDirectory>,
        gateway: Arc<dyn MessageGateway>,
        publisher: Arc<dyn UpdatePublisher>,
        tokens: AccessTokenService,
        limits: AttachmentLimits,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            attachments,
            sessions,
            store,
            scanner,
            directory,
            gateway,
            publisher,
            validator: Validator::new(limits.clone()),
            tokens,
            limits,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn limits(&self) -> &AttachmentLimits {
        &self.limits
    }

    /// Create the carrier message and one upload session per declared file.
    #[instrument(skip(self, request), fields(sender_id = sender_id))]
    pub async fn create_sessions(
        &self,
        sender_id: Id,
        request: CreateSessionsRequest,
    ) -> AttachmentResult<CreateSessionsResponse> {
        let content = request.content.as_deref().unwrap_or("").trim().to_string();
        if content.chars().count() > MESSAGE_MAX_LENGTH {
            return Err(AttachmentError::ContentTooLong);
        }
        let expires_at = self.resolve_expiry(request.expires_in_seconds)?;

        let recipient_id = self
            .directory
            .find_by_username(request.recipient_username.trim())
            .await
            .ok_or_else(|| AttachmentError::RecipientNotFound(request.recipient_username.clone()))?;
        if recipient_id == sender_id {
            return Err(AttachmentError::SelfRecipient);
        }

        let pending = self.sessions.count_live_for_owner(sender_id).await?;
        self.validator.validate_batch(&request.attachments, pending)?;

        let message = self
            .gateway
            .create_message(sender_id, recipient_id, &content)
            .await?;

        let mut uploads = Vec::with_capacity(request.attachments.len());
        for spec in &request.attachments {
            let kind = Validator::resolve_type(&spec.mime_type);
            let storage_key = BlobStore::generate_key(&spec.file_name);
            let mut attachment = Attachment::new(
                message.id,
                kind,
                spec.mime_type.trim().to_ascii_lowercase(),
                spec.size_bytes,
                storage_key,
            );
            attachment.original_filename = Some(spec.file_name.trim().to_string());
            attachment.checksum = spec
                .checksum
                .as_deref()
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty());
            attachment.width = spec.width;
            attachment.height = spec.height;
            attachment.duration_seconds = spec.duration_seconds;
            attachment.alt_text = spec
                .alt_text
                .as_deref()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty());
            attachment.expires_at = expires_at;

            let attachment_id = self.attachments.create(&mut attachment).await?;

            let temp_key = BlobStore::create_temp_key();
            self.store.ensure_temp_dir(&temp_key).await?;
            let session = UploadSession::new(attachment_id, sender_id, spec.size_bytes, temp_key);
            self.sessions.create(&session).await?;

            uploads.push(UploadSessionHandle {
                upload_url: format!("{}/api/v1/attachments/uploads/{}", self.base_url, session.id),
                finalize_url: format!(
                    "{}/api/v1/attachments/uploads/{}/finalize",
                    self.base_url, session.id
                ),
                upload_id: session.id,
                attachment_id,
                chunk_size_bytes: self.limits.chunk_size_bytes,
            });
        }

        info!(
            message_id = message.id,
            count = uploads.len(),
            "Created upload sessions"
        );
        Ok(CreateSessionsResponse {
            message_id: message.id,
            uploads,
        })
    }

    /// Accept one chunk of an upload. Re-delivery of an already-written
    /// chunk overwrites it; progress never regresses.
    #[instrument(skip(self, data), fields(upload_id = upload_id, chunk_index = chunk_index))]
    pub async fn upload_chunk(
        &self,
        owner_id: Id,
        upload_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: &[u8],
    ) -> AttachmentResult<UploadChunkProgress> {
        let mut session = self.live_session(upload_id, owner_id).await?;
        if total_chunks == 0 || chunk_index >= total_chunks {
            return Err(AttachmentError::InvalidChunk {
                index: chunk_index,
                total: total_chunks,
            });
        }

        let mut attachment = self.require_attachment(session.attachment_id).await?;
        match attachment.status {
            AttachmentStatus::Uploading => {}
            AttachmentStatus::Failed => {
                // A failed attachment comes back to life when its owner
                // retries the upload, up to the retry cap.
                if session.retry_count >= self.limits.max_upload_retries {
                    return Err(AttachmentError::RetriesExhausted);
                }
                attachment.transition(AttachmentStatus::Uploading);
                self.attachments.update(&attachment).await?;
                self.publish_update(&attachment).await;
                session.retry_count += 1;
                warn!(
                    attachment_id = attachment.id,
                    retry = session.retry_count,
                    "Resumed failed upload"
                );
            }
            _ => return Err(AttachmentError::InvalidState),
        }

        if total_chunks == 1 {
            // unchunked upload: land the bytes as the assembled file and
            // skip the concatenation pass entirely
            self.store.write_temp_file(&session.temp_key, data).await?;
        } else {
            self.store
                .write_chunk(&session.temp_key, chunk_index, data)
                .await?;
        }
        session.record_chunk(chunk_index, total_chunks);
        self.sessions.update(&session).await?;

        Ok(UploadChunkProgress {
            upload_id: session.id,
            uploaded_chunks: session.uploaded_chunks,
            total_chunks: session.total_chunks,
        })
    }

    /// Assemble the chunks and run the integrity gauntlet: byte count,
    /// checksum, content sniff. On success the blob lands in permanent
    /// storage and the attachment awaits [`process`](Self::process).
    ///
    /// Failures are recoverable: a missing chunk leaves everything as it
    /// was, and an integrity failure marks the attachment FAILED and
    /// scrubs temp, but keeps the session live so re-uploading chunks can
    /// revive it.
    #[instrument(skip(self), fields(upload_id = upload_id))]
    pub async fn finalize(&self, owner_id: Id, upload_id: &str) -> AttachmentResult<Attachment> {
        let mut session = self.live_session(upload_id, owner_id).await?;
        let mut attachment = self.require_attachment(session.attachment_id).await?;
        if attachment.status != AttachmentStatus::Uploading {
            return Err(AttachmentError::InvalidState);
        }

        if attachment.is_expired_at(Utc::now()) {
            attachment.transition(AttachmentStatus::Expired);
            self.attachments.update(&attachment).await?;
            session.complete(Some("Expired before finalize"));
            self.sessions.update(&session).await?;
            self.store.delete_temp(&session.temp_key).await?;
            self.publish_update(&attachment).await;
            return Err(AttachmentError::Expired);
        }

        let assembled = if session.total_chunks <= 1 {
            // single-chunk uploads already sit at the assembled path
            let path = self.store.assembled_path(&session.temp_key)?;
            if !tokio::fs::try_exists(&path).await.map_err(StorageError::from)? {
                return Err(AttachmentError::MissingChunk(0));
            }
            path
        } else {
            self.store
                .assemble_chunks(&session.temp_key, session.total_chunks)
                .await?
        };

        let actual_bytes = tokio::fs::metadata(&assembled)
            .await
            .map_err(StorageError::from)?
            .len() as i64;
        if actual_bytes != session.expected_bytes {
            let reason = format!(
                "Size mismatch: declared {} bytes, received {}",
                session.expected_bytes, actual_bytes
            );
            return self
                .fail_upload(&mut attachment, &mut session, reason)
                .await;
        }

        let digest = sha256_hex(&assembled).await?;
        if let Some(declared) = &attachment.checksum {
            if declared != &digest {
                let reason = format!("Checksum mismatch: declared {declared}, computed {digest}");
                return self
                    .fail_upload(&mut attachment, &mut session, reason)
                    .await;
            }
        }

        if let Some(detected) = self.sniff_mime(&assembled, &attachment).await? {
            if !Validator::is_mime_allowed(attachment.kind, &detected) {
                let reason = format!("Content type {detected} does not match declared {}", attachment.mime_type);
                return self
                    .fail_upload(&mut attachment, &mut session, reason)
                    .await;
            }
            attachment.mime_type = detected;
        }
        // recorded only past the sniff gate, so a rejected body's digest
        // never sticks as the declared checksum for a retry
        attachment.checksum = Some(digest);

        if attachment.is_image() && (attachment.width.is_none() || attachment.height.is_none()) {
            if let Some((w, h)) = thumbnail::probe_dimensions(&assembled) {
                attachment.width = Some(w as i32);
                attachment.height = Some(h as i32);
            }
        }

        self.store
            .store_permanent(&assembled, &attachment.storage_key)
            .await?;
        self.store.delete_temp(&session.temp_key).await?;

        self.attachments.update(&attachment).await?;
        session.complete(None);
        self.sessions.update(&session).await?;

        info!(
            attachment_id = attachment.id,
            size_bytes = actual_bytes,
            "Finalized upload"
        );
        Ok(attachment)
    }

    /// Post-processing: scan the permanent blob, derive a thumbnail for
    /// clean images, and settle the terminal-or-READY status. Idempotent:
    /// anything not in UPLOADING is left untouched, so a crashed or
    /// duplicated dispatch cannot double-apply.
    #[instrument(skip(self), fields(attachment_id = attachment_id))]
    pub async fn process(&self, attachment_id: Id) -> AttachmentResult<()> {
        let mut attachment = self.require_attachment(attachment_id).await?;
        if attachment.status != AttachmentStatus::Uploading {
            return Ok(());
        }

        // the expiry may have passed while the bytes were in flight
        if attachment.is_expired_at(Utc::now()) {
            warn!(attachment_id, "Expired before processing");
            attachment.transition(AttachmentStatus::Expired);
            self.attachments.update(&attachment).await?;
            self.store.delete_permanent(&attachment.storage_key).await?;
            self.publish_update(&attachment).await;
            return Ok(());
        }

        let path = self.store.permanent_path(&attachment.storage_key)?;
        let outcome = self.scanner.scan(&path).await;
        match outcome.status {
            ScanStatus::Clean | ScanStatus::Skipped => {
                if outcome.status == ScanStatus::Skipped {
                    warn!(attachment_id, "Scan skipped; accepting unscanned upload");
                }
                if attachment.is_image() && attachment.thumbnail_key.is_none() {
                    match thumbnail::render_thumbnail(&path) {
                        Ok(thumb) => {
                            let name = attachment
                                .original_filename
                                .clone()
                                .unwrap_or_else(|| "thumbnail".to_string());
                            let key = self.store.store_thumbnail(&thumb.data, &name).await?;
                            attachment.thumbnail_key = Some(key);
                            attachment.width.get_or_insert(thumb.width as i32);
                            attachment.height.get_or_insert(thumb.height as i32);
                        }
                        Err(err) => {
                            // Thumbnails are a convenience, never a gate.
                            warn!(attachment_id, error = %err, "Thumbnail generation failed");
                        }
                    }
                }
                attachment.transition(AttachmentStatus::Ready);
            }
            ScanStatus::Infected => {
                warn!(attachment_id, verdict = %outcome.message, "Quarantined infected upload");
                self.store.move_to_quarantine(&attachment.storage_key).await?;
                attachment.transition(AttachmentStatus::Quarantined);
            }
            ScanStatus::Failed => {
                warn!(attachment_id, error = %outcome.message, "Scan failed; rejecting upload");
                self.store.delete_permanent(&attachment.storage_key).await?;
                attachment.transition(AttachmentStatus::Failed);
            }
        }

        self.attachments.update(&attachment).await?;
        self.publish_update(&attachment).await;
        Ok(())
    }

    /// Abort an upload. The session closes, temp chunks are scrubbed, and
    /// the attachment is left FAILED (re-creatable only through a new
    /// session).
    #[instrument(skip(self), fields(upload_id = upload_id))]
    pub async fn cancel(&self, owner_id: Id, upload_id: &str) -> AttachmentResult<()> {
        let mut session = self.live_session(upload_id, owner_id).await?;
        let mut attachment = self.require_attachment(session.attachment_id).await?;

        session.complete(Some("Cancelled"));
        self.sessions.update(&session).await?;
        self.store.delete_temp(&session.temp_key).await?;

        if attachment.status == AttachmentStatus::Uploading {
            attachment.transition(AttachmentStatus::Failed);
            self.attachments.update(&attachment).await?;
            self.publish_update(&attachment).await;
        }
        info!(attachment_id = attachment.id, "Cancelled upload");
        Ok(())
    }

    /// Fetch one attachment as the given viewer sees it. The viewer must
    /// be a participant of the carrying message.
    pub async fn view(&self, viewer_id: Id, attachment_id: Id) -> AttachmentResult<AttachmentView> {
        let attachment = self.require_attachment(attachment_id).await?;
        self.assert_participant(viewer_id, &attachment).await?;
        self.render_view(&attachment, viewer_id)
    }

    /// Open a download stream against a bearer token.
    pub async fn open_download(&self, token: &str) -> AttachmentResult<DownloadStream> {
        let payload = self.tokens.verify(token)?;
        self.open_download_for(payload.user_id, payload.attachment_id)
            .await
    }

    /// Open a download stream for an already-authenticated participant.
    pub async fn open_download_for(
        &self,
        viewer_id: Id,
        attachment_id: Id,
    ) -> AttachmentResult<DownloadStream> {
        let attachment = self.require_ready(viewer_id, attachment_id).await?;
        let (file, size_bytes) = self.store.open_permanent(&attachment.storage_key).await?;
        Ok(DownloadStream {
            attachment_id,
            file,
            size_bytes,
            mime_type: attachment.mime_type,
            file_name: attachment.original_filename,
        })
    }

    /// Open a thumbnail stream against a bearer token.
    pub async fn open_thumbnail(&self, token: &str) -> AttachmentResult<DownloadStream> {
        let payload = self.tokens.verify(token)?;
        self.open_thumbnail_for(payload.user_id, payload.attachment_id)
            .await
    }

    /// Open a thumbnail stream for an already-authenticated participant.
    pub async fn open_thumbnail_for(
        &self,
        viewer_id: Id,
        attachment_id: Id,
    ) -> AttachmentResult<DownloadStream> {
        let attachment = self.require_ready(viewer_id, attachment_id).await?;
        let key = attachment
            .thumbnail_key
            .as_deref()
            .ok_or(AttachmentError::NotFound)?;
        let (file, size_bytes) = self.store.open_thumbnail(key).await?;
        Ok(DownloadStream {
            attachment_id,
            file,
            size_bytes,
            mime_type: "image/jpeg".to_string(),
            file_name: None,
        })
    }

    /// Build the client-facing view, minting download URLs only for READY,
    /// unexpired attachments.
    pub fn render_view(&self, attachment: &Attachment, viewer_id: Id) -> AttachmentResult<AttachmentView> {
        let id = attachment.id.ok_or(AttachmentError::NotFound)?;
        let servable =
            attachment.status == AttachmentStatus::Ready && !attachment.is_expired_at(Utc::now());
        let (download_url, thumbnail_url) = if servable {
            let token = self.tokens.issue(id, viewer_id)?;
            let download = format!("{}/api/v1/attachments/{id}?token={token}", self.base_url);
            let thumb = attachment.thumbnail_key.as_ref().map(|_| {
                format!("{}/api/v1/attachments/{id}/thumbnail?token={token}", self.base_url)
            });
            (Some(download), thumb)
        } else {
            (None, None)
        };

        Ok(AttachmentView {
            id,
            public_id: attachment.public_id.clone(),
            kind: attachment.kind,
            mime_type: attachment.mime_type.clone(),
            size_bytes: attachment.size_bytes,
            width: attachment.width,
            height: attachment.height,
            duration_seconds: attachment.duration_seconds,
            alt_text: attachment.alt_text.clone(),
            file_name: attachment.original_filename.clone(),
            status: attachment.status,
            expires_at: attachment.expires_at,
            download_url,
            thumbnail_url,
        })
    }

    async fn require_ready(&self, viewer_id: Id, attachment_id: Id) -> AttachmentResult<Attachment> {
        let attachment = self.require_attachment(attachment_id).await?;
        self.assert_participant(viewer_id, &attachment).await?;
        match attachment.status {
            AttachmentStatus::Ready if attachment.is_expired_at(Utc::now()) => {
                Err(AttachmentError::Expired)
            }
            AttachmentStatus::Ready => Ok(attachment),
            AttachmentStatus::Expired => Err(AttachmentError::Expired),
            // Quarantined, failed, and in-flight uploads do not exist as
            // far as download clients are concerned.
            _ => Err(AttachmentError::NotFound),
        }
    }

    async fn assert_participant(&self, viewer_id: Id, attachment: &Attachment) -> AttachmentResult<()> {
        let message = self
            .gateway
            .find_message(attachment.message_id)
            .await
            .ok_or(AttachmentError::NotFound)?;
        if message.sender_id != viewer_id && message.recipient_id != viewer_id {
            return Err(AttachmentError::Forbidden);
        }
        Ok(())
    }

    async fn live_session(&self, upload_id: &str, owner_id: Id) -> AttachmentResult<UploadSession> {
        let session = self
            .sessions
            .find_for_owner(upload_id, owner_id)
            .await?
            .ok_or(AttachmentError::SessionNotFound)?;
        if session.completed {
            return Err(AttachmentError::SessionClosed);
        }
        Ok(session)
    }

    async fn require_attachment(&self, id: Id) -> AttachmentResult<Attachment> {
        self.attachments
            .find(id)
            .await?
            .ok_or(AttachmentError::NotFound)
    }

    fn resolve_expiry(
        &self,
        expires_in_seconds: Option<i64>,
    ) -> AttachmentResult<Option<chrono::DateTime<Utc>>> {
        let Some(seconds) = expires_in_seconds else {
            return Ok(None);
        };
        let max_seconds = self.limits.max_expiry_hours as i64 * 3600;
        if seconds <= 0 || (max_seconds > 0 && seconds > max_seconds) {
            return Err(AttachmentError::InvalidExpiry(max_seconds));
        }
        Ok(Some(Utc::now() + Duration::seconds(seconds)))
    }

    /// Sniff the real content type from magic bytes, falling back to the
    /// filename extension for formats without a signature.
    async fn sniff_mime(
        &self,
        path: &std::path::Path,
        attachment: &Attachment,
    ) -> AttachmentResult<Option<String>> {
        use tokio::io::AsyncReadExt;

        let mut head = vec![0u8; SNIFF_BYTES];
        let mut file = tokio::fs::File::open(path).await.map_err(StorageError::from)?;
        let read = file.read(&mut head).await.map_err(StorageError::from)?;
        head.truncate(read);

        if let Some(kind) = infer::get(&head) {
            return Ok(Some(kind.mime_type().to_string()));
        }
        if let Some(name) = &attachment.original_filename {
            if let Some(guessed) = mime_guess::from_path(name).first_raw() {
                return Ok(Some(guessed.to_ascii_lowercase()));
            }
        }
        Ok(None)
    }

    /// Mark an integrity failure: attachment FAILED, failure reason
    /// recorded on the session, temp bytes scrubbed. The session stays
    /// open so the owner can re-upload chunks and finalize again, within
    /// the retry cap.
    async fn fail_upload(
        &self,
        attachment: &mut Attachment,
        session: &mut UploadSession,
        reason: String,
    ) -> AttachmentResult<Attachment> {
        warn!(attachment_id = attachment.id, reason = %reason, "Upload failed integrity checks");
        attachment.transition(AttachmentStatus::Failed);
        self.attachments.update(attachment).await?;
        session.last_error = Some(reason);
        self.sessions.update(session).await?;
        self.store.delete_temp(&session.temp_key).await?;
        self.publish_update(attachment).await;
        Ok(attachment.clone())
    }

    /// Best-effort realtime notification; delivery failures are logged
    /// and never bubble into the lifecycle result.
    async fn publish_update(&self, attachment: &Attachment) {
        if let Err(err) = self.publisher.message_updated(attachment.message_id).await {
            warn!(attachment_id = attachment.id, error = %err, "Realtime publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttachmentSpec;
    use crate::repo::{MemoryAttachmentRepo, MemorySessionRepo};
    use courier_core::config::{StorageConfig, TokenConfig};
    use courier_core::events::{MemoryDirectory, MemoryMessageGateway, MemoryPublisher};
    use courier_scan::StaticScanner;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    struct Harness {
        service: AttachmentService,
        publisher: Arc<MemoryPublisher>,
        _dir: TempDir,
    }

    async fn harness_with(scanner: Arc<dyn VirusScanner>, limits: AttachmentLimits) -> Harness {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let store = BlobStore::new(&StorageConfig {
            permanent_dir: format!("{root}/perm"),
            temp_dir: format!("{root}/tmp"),
            quarantine_dir: format!("{root}/quarantine"),
            thumbnail_dir: format!("{root}/thumbs"),
        });
        store.init().await.unwrap();

        let directory = Arc::new(MemoryDirectory::new());
        directory.add_user(1, "alice").await;
        directory.add_user(2, "bob").await;
        directory.add_user(3, "mallory").await;

        let publisher = Arc::new(MemoryPublisher::new());
        let service = AttachmentService::new(
            Arc::new(MemoryAttachmentRepo::new()),
            Arc::new(MemorySessionRepo::new()),
            store,
            scanner,
            directory,
            Arc::new(MemoryMessageGateway::new()),
            publisher.clone(),
            AccessTokenService::new(&TokenConfig {
                secret: "test-secret".to_string(),
                download_ttl_secs: 900,
            }),
            limits,
            "http://localhost:8080",
        );
        Harness {
            service,
            publisher,
            _dir: dir,
        }
    }

    async fn harness(scanner: Arc<dyn VirusScanner>) -> Harness {
        harness_with(scanner, AttachmentLimits::default()).await
    }

    fn png_bytes() -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 7]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    fn request_for(bytes: &[u8], file_name: &str, mime: &str) -> CreateSessionsRequest {
        CreateSessionsRequest {
            recipient_username: "bob".to_string(),
            content: Some("look at this".to_string()),
            expires_in_seconds: None,
            attachments: vec![AttachmentSpec {
                file_name: file_name.to_string(),
                mime_type: mime.to_string(),
                size_bytes: bytes.len() as i64,
                checksum: None,
                width: None,
                height: None,
                duration_seconds: None,
                alt_text: None,
            }],
        }
    }

    async fn upload_all(h: &Harness, upload_id: &str, bytes: &[u8], chunks: u32) {
        let per = (bytes.len() as u32).div_ceil(chunks) as usize;
        for (i, chunk) in bytes.chunks(per).enumerate() {
            h.service
                .upload_chunk(1, upload_id, i as u32, chunks, chunk)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_clean_image_reaches_ready_with_thumbnail() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];

        upload_all(&h, &upload.upload_id, &bytes, 2).await;
        let finalized = h.service.finalize(1, &upload.upload_id).await.unwrap();
        assert_eq!(finalized.status, AttachmentStatus::Uploading);
        assert_eq!(finalized.width, Some(64));
        assert!(finalized.checksum.is_some());

        h.service.process(upload.attachment_id).await.unwrap();
        let view = h.service.view(2, upload.attachment_id).await.unwrap();
        assert_eq!(view.status, AttachmentStatus::Ready);
        assert!(view.download_url.is_some());
        assert!(view.thumbnail_url.is_some());
        assert_eq!(h.publisher.published().await, vec![response.message_id]);
    }

    #[tokio::test]
    async fn test_download_stream_round_trip() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;
        h.service.finalize(1, &upload.upload_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();

        let view = h.service.view(1, upload.attachment_id).await.unwrap();
        let url = view.download_url.unwrap();
        let token = url.split("token=").nth(1).unwrap();
        let stream = h.service.open_download(token).await.unwrap();
        assert_eq!(stream.size_bytes, bytes.len() as u64);
        assert_eq!(stream.mime_type, "image/png");

        let thumb = h.service.open_thumbnail(token).await.unwrap();
        assert!(thumb.size_bytes > 0);
        assert_eq!(thumb.mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_infected_upload_is_quarantined() {
        let h = harness(Arc::new(StaticScanner::infected("Eicar-Test-Signature"))).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;
        let finalized = h.service.finalize(1, &upload.upload_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();

        let view = h.service.view(1, upload.attachment_id).await.unwrap();
        assert_eq!(view.status, AttachmentStatus::Quarantined);
        assert!(view.download_url.is_none());
        // blob moved out of permanent storage
        assert!(!h
            .service
            .store
            .permanent_exists(&finalized.storage_key)
            .await
            .unwrap());
        assert!(h
            .service
            .store
            .quarantine_exists(&finalized.storage_key)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_scan_failure_fails_closed() {
        let h = harness(Arc::new(StaticScanner::with_reply("stream: ERROR"))).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;
        let finalized = h.service.finalize(1, &upload.upload_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();

        let view = h.service.view(1, upload.attachment_id).await.unwrap();
        assert_eq!(view.status, AttachmentStatus::Failed);
        assert!(!h
            .service
            .store
            .permanent_exists(&finalized.storage_key)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_process_retires_attachment_expired_in_flight() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let mut request = request_for(&bytes, "photo.png", "image/png");
        request.expires_in_seconds = Some(3600);
        let response = h.service.create_sessions(1, request).await.unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;
        let finalized = h.service.finalize(1, &upload.upload_id).await.unwrap();

        // expiry passes between finalize and processing
        let mut attachment = h
            .service
            .attachments
            .find(upload.attachment_id)
            .await
            .unwrap()
            .unwrap();
        attachment.expires_at = Some(Utc::now() - Duration::minutes(1));
        h.service.attachments.update(&attachment).await.unwrap();

        h.service.process(upload.attachment_id).await.unwrap();
        let swept = h
            .service
            .attachments
            .find(upload.attachment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(swept.status, AttachmentStatus::Expired);
        assert!(!h
            .service
            .store
            .permanent_exists(&finalized.storage_key)
            .await
            .unwrap());
        assert_eq!(h.publisher.published().await, vec![response.message_id]);
    }

    #[tokio::test]
    async fn test_process_is_idempotent() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;
        h.service.finalize(1, &upload.upload_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();
        assert_eq!(h.publisher.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_with_missing_chunk_is_recoverable() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];

        let half = bytes.len() / 2;
        h.service
            .upload_chunk(1, &upload.upload_id, 1, 2, &bytes[half..])
            .await
            .unwrap();
        let err = h.service.finalize(1, &upload.upload_id).await.unwrap_err();
        assert!(matches!(err, AttachmentError::MissingChunk(0)));

        // deliver the missing chunk and finalize again
        h.service
            .upload_chunk(1, &upload.upload_id, 0, 2, &bytes[..half])
            .await
            .unwrap();
        h.service.finalize(1, &upload.upload_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();
        let view = h.service.view(1, upload.attachment_id).await.unwrap();
        assert_eq!(view.status, AttachmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_and_closes_session() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let mut request = request_for(&bytes, "photo.png", "image/png");
        request.attachments[0].size_bytes = bytes.len() as i64 + 5;
        let response = h.service.create_sessions(1, request).await.unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;

        let finalized = h.service.finalize(1, &upload.upload_id).await.unwrap();
        assert_eq!(finalized.status, AttachmentStatus::Failed);
        // the FAILED transition is published
        assert_eq!(h.publisher.published().await, vec![response.message_id]);
        // the attachment is FAILED, so finalizing again without a fresh
        // chunk upload is refused
        let err = h.service.finalize(1, &upload.upload_id).await.unwrap_err();
        assert!(matches!(err, AttachmentError::InvalidState));
    }

    #[tokio::test]
    async fn test_single_chunk_upload_lands_at_assembled_path() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];
        h.service
            .upload_chunk(1, &upload.upload_id, 0, 1, &bytes)
            .await
            .unwrap();

        let session = h
            .service
            .sessions
            .find_for_owner(&upload.upload_id, 1)
            .await
            .unwrap()
            .unwrap();
        let assembled = h.service.store.assembled_path(&session.temp_key).unwrap();
        assert!(tokio::fs::try_exists(&assembled).await.unwrap());
        // no chunk file to concatenate later
        assert!(!tokio::fs::try_exists(assembled.with_file_name("chunk-0"))
            .await
            .unwrap());

        h.service.finalize(1, &upload.upload_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();
        let view = h.service.view(1, upload.attachment_id).await.unwrap();
        assert_eq!(view.status, AttachmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_integrity_failure_scrubs_temp_and_allows_reupload() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let good = png_bytes();
        // same byte count, but an MP4 signature the sniff gate rejects
        let bad = {
            let mut b = vec![0, 0, 0, 0x18];
            b.extend_from_slice(b"ftypmp42");
            b.resize(good.len(), 0);
            b
        };
        let response = h
            .service
            .create_sessions(1, request_for(&good, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];

        upload_all(&h, &upload.upload_id, &bad, 1).await;
        let failed = h.service.finalize(1, &upload.upload_id).await.unwrap();
        assert_eq!(failed.status, AttachmentStatus::Failed);
        // the rejected digest is not persisted as a declared checksum
        assert!(failed.checksum.is_none());

        let session = h
            .service
            .sessions
            .find_for_owner(&upload.upload_id, 1)
            .await
            .unwrap()
            .unwrap();
        assert!(session.last_error.is_some());
        let assembled = h.service.store.assembled_path(&session.temp_key).unwrap();
        assert!(!tokio::fs::try_exists(&assembled).await.unwrap());

        // re-uploading the true bytes revives and completes the upload
        upload_all(&h, &upload.upload_id, &good, 1).await;
        h.service.finalize(1, &upload.upload_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();
        let view = h.service.view(1, upload.attachment_id).await.unwrap();
        assert_eq!(view.status, AttachmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let mut request = request_for(&bytes, "photo.png", "image/png");
        request.attachments[0].checksum = Some("0".repeat(64));
        let response = h.service.create_sessions(1, request).await.unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;

        let finalized = h.service.finalize(1, &upload.upload_id).await.unwrap();
        assert_eq!(finalized.status, AttachmentStatus::Failed);
    }

    #[tokio::test]
    async fn test_content_sniff_rejects_mislabelled_file() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        // declared as PNG, actually an MP4 signature
        let bytes = {
            let mut b = vec![0, 0, 0, 0x18];
            b.extend_from_slice(b"ftypmp42");
            b.extend_from_slice(&[0u8; 64]);
            b
        };
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;

        let finalized = h.service.finalize(1, &upload.upload_id).await.unwrap();
        assert_eq!(finalized.status, AttachmentStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_upload_resurrects_until_retry_cap() {
        let mut limits = AttachmentLimits::default();
        limits.max_upload_retries = 1;
        let h = harness_with(Arc::new(StaticScanner::clean()), limits).await;
        let bytes = png_bytes();
        let mut request = request_for(&bytes, "photo.png", "image/png");
        // declared size never matches, so every finalize fails integrity
        request.attachments[0].size_bytes = bytes.len() as i64 + 1;
        let response = h.service.create_sessions(1, request).await.unwrap();
        let upload = &response.uploads[0];

        upload_all(&h, &upload.upload_id, &bytes, 1).await;
        let failed = h.service.finalize(1, &upload.upload_id).await.unwrap();
        assert_eq!(failed.status, AttachmentStatus::Failed);

        // a fresh chunk upload revives the FAILED attachment
        let progress = h
            .service
            .upload_chunk(1, &upload.upload_id, 0, 1, &bytes)
            .await
            .unwrap();
        assert_eq!(progress.uploaded_chunks, 1);
        // one publish for the failure, one for the revival
        assert_eq!(h.publisher.published().await.len(), 2);
        let revived = h
            .service
            .attachments
            .find(upload.attachment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revived.status, AttachmentStatus::Uploading);

        // fail again; with max_upload_retries = 1 the next revival is refused
        h.service.finalize(1, &upload.upload_id).await.unwrap();
        let err = h
            .service
            .upload_chunk(1, &upload.upload_id, 0, 1, &bytes)
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentError::RetriesExhausted));
    }

    #[tokio::test]
    async fn test_cancel_scrubs_and_fails() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];
        h.service
            .upload_chunk(1, &upload.upload_id, 0, 2, &bytes[..4])
            .await
            .unwrap();

        h.service.cancel(1, &upload.upload_id).await.unwrap();
        let view = h.service.view(1, upload.attachment_id).await.unwrap();
        assert_eq!(view.status, AttachmentStatus::Failed);
        assert_eq!(h.publisher.published().await, vec![response.message_id]);

        let err = h
            .service
            .upload_chunk(1, &upload.upload_id, 1, 2, &bytes[4..8])
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentError::SessionClosed));
    }

    #[tokio::test]
    async fn test_session_is_invisible_to_other_users() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let upload = &response.uploads[0];
        let err = h
            .service
            .upload_chunk(2, &upload.upload_id, 0, 1, &bytes)
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_view_requires_participation() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let response = h
            .service
            .create_sessions(1, request_for(&bytes, "photo.png", "image/png"))
            .await
            .unwrap();
        let err = h
            .service
            .view(3, response.uploads[0].attachment_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentError::Forbidden));
    }

    #[tokio::test]
    async fn test_self_send_is_rejected() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let mut request = request_for(b"x", "a.png", "image/png");
        request.recipient_username = "alice".to_string();
        let err = h.service.create_sessions(1, request).await.unwrap_err();
        assert!(matches!(err, AttachmentError::SelfRecipient));
    }

    #[tokio::test]
    async fn test_recipient_not_found() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let mut request = request_for(b"x", "a.png", "image/png");
        request.recipient_username = "nobody".to_string();
        let err = h.service.create_sessions(1, request).await.unwrap_err();
        assert!(matches!(err, AttachmentError::RecipientNotFound(_)));
    }

    #[tokio::test]
    async fn test_expiry_bounds() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let mut request = request_for(b"x", "a.png", "image/png");
        request.expires_in_seconds = Some(0);
        assert!(matches!(
            h.service.create_sessions(1, request).await.unwrap_err(),
            AttachmentError::InvalidExpiry(_)
        ));

        let mut request = request_for(b"x", "a.png", "image/png");
        request.expires_in_seconds = Some(169 * 3600);
        assert!(matches!(
            h.service.create_sessions(1, request).await.unwrap_err(),
            AttachmentError::InvalidExpiry(_)
        ));

        let mut request = request_for(b"x", "a.png", "image/png");
        request.expires_in_seconds = Some(3600);
        let response = h.service.create_sessions(1, request).await.unwrap();
        let view = h
            .service
            .view(1, response.uploads[0].attachment_id)
            .await
            .unwrap();
        assert!(view.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_content_too_long() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let mut request = request_for(b"x", "a.png", "image/png");
        request.content = Some("y".repeat(2001));
        assert!(matches!(
            h.service.create_sessions(1, request).await.unwrap_err(),
            AttachmentError::ContentTooLong
        ));
    }

    #[tokio::test]
    async fn test_pending_quota() {
        let mut limits = AttachmentLimits::default();
        limits.max_pending_per_user = 2;
        let h = harness_with(Arc::new(StaticScanner::clean()), limits).await;
        let bytes = png_bytes();
        h.service
            .create_sessions(1, request_for(&bytes, "a.png", "image/png"))
            .await
            .unwrap();
        h.service
            .create_sessions(1, request_for(&bytes, "b.png", "image/png"))
            .await
            .unwrap();
        let err = h
            .service
            .create_sessions(1, request_for(&bytes, "c.png", "image/png"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttachmentError::Validation(ValidationError::TooManyPending)
        ));
    }

    #[tokio::test]
    async fn test_expired_download_is_gone() {
        let h = harness(Arc::new(StaticScanner::clean())).await;
        let bytes = png_bytes();
        let mut request = request_for(&bytes, "photo.png", "image/png");
        request.expires_in_seconds = Some(3600);
        let response = h.service.create_sessions(1, request).await.unwrap();
        let upload = &response.uploads[0];
        upload_all(&h, &upload.upload_id, &bytes, 1).await;
        h.service.finalize(1, &upload.upload_id).await.unwrap();
        h.service.process(upload.attachment_id).await.unwrap();

        // backdate the expiry
        let mut attachment = h
            .service
            .attachments
            .find(upload.attachment_id)
            .await
            .unwrap()
            .unwrap();
        attachment.expires_at = Some(Utc::now() - Duration::minutes(1));
        h.service.attachments.update(&attachment).await.unwrap();

        let token = h.service.tokens.issue(upload.attachment_id, 1).unwrap();
        let err = h.service.open_download(&token).await.unwrap_err();
        assert!(matches!(err, AttachmentError::Expired));

        // and the view no longer mints URLs
        let view = h.service.view(1, upload.attachment_id).await.unwrap();
        assert!(view.download_url.is_none());
    }
}
