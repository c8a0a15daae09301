//! Attachment validation policy.
//!
//! Pure checks over declared metadata; every violation is a client error
//! naming the limit that was exceeded.

use courier_core::config::AttachmentLimits;
use courier_core::types::AttachmentType;
use thiserror::Error;

use crate::model::AttachmentSpec;

const IMAGE_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];
const VIDEO_MIME_TYPES: &[&str] = &["video/mp4", "video/webm", "video/quicktime"];
const DOCUMENT_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

pub const MAX_ALT_TEXT_CHARS: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("At least one attachment is required.")]
    NoAttachments,
    #[error("You can attach up to {0} files.")]
    TooManyFiles(usize),
    #[error("Too many pending uploads.")]
    TooManyPending,
    #[error("Attachment filename is required.")]
    MissingFilename,
    #[error("Attachment mime type is required.")]
    MissingMimeType,
    #[error("Attachment size is required.")]
    MissingSize,
    #[error("Attachment exceeds max size of {0} MB.")]
    TooLarge(u64),
    #[error("Attachment type is not supported.")]
    UnsupportedMimeType(String),
    #[error("Alt text must be {MAX_ALT_TEXT_CHARS} characters or less.")]
    AltTextTooLong,
    #[error("Alt text cannot contain HTML.")]
    AltTextMarkup,
}

#[derive(Debug, Clone)]
pub struct Validator {
    limits: AttachmentLimits,
}

impl Validator {
    pub fn new(limits: AttachmentLimits) -> Self {
        Self { limits }
    }

    /// Validate a whole session-creation batch. `pending` is the count of
    /// uploads the owner already has in flight.
    pub fn validate_batch(&self, specs: &[AttachmentSpec], pending: usize) -> Result<(), ValidationError> {
        if specs.is_empty() {
            return Err(ValidationError::NoAttachments);
        }
        if specs.len() > self.limits.max_files {
            return Err(ValidationError::TooManyFiles(self.limits.max_files));
        }
        if pending + specs.len() > self.limits.max_pending_per_user {
            return Err(ValidationError::TooManyPending);
        }
        for spec in specs {
            self.validate_spec(spec)?;
        }
        Ok(())
    }

    pub fn validate_spec(&self, spec: &AttachmentSpec) -> Result<(), ValidationError> {
        if spec.file_name.trim().is_empty() {
            return Err(ValidationError::MissingFilename);
        }
        let mime = normalize(&spec.mime_type);
        if mime.is_empty() {
            return Err(ValidationError::MissingMimeType);
        }
        let kind = Self::resolve_type(&mime);
        if spec.size_bytes <= 0 {
            return Err(ValidationError::MissingSize);
        }
        let max = self.max_size_for_type(kind);
        if spec.size_bytes as u64 > max {
            return Err(ValidationError::TooLarge((max / (1024 * 1024)).max(1)));
        }
        if !Self::is_mime_allowed(kind, &mime) {
            return Err(ValidationError::UnsupportedMimeType(mime));
        }
        if let Some(alt) = &spec.alt_text {
            validate_alt_text(alt)?;
        }
        Ok(())
    }

    /// Map a MIME type to its attachment category. Anything not an image
    /// or video MIME falls into the document bucket, where the document
    /// allow-list decides.
    pub fn resolve_type(mime_type: &str) -> AttachmentType {
        let mime = normalize(mime_type);
        if IMAGE_MIME_TYPES.contains(&mime.as_str()) {
            AttachmentType::Image
        } else if VIDEO_MIME_TYPES.contains(&mime.as_str()) {
            AttachmentType::Video
        } else {
            AttachmentType::Document
        }
    }

    pub fn is_mime_allowed(kind: AttachmentType, mime_type: &str) -> bool {
        let mime = normalize(mime_type);
        let allowed = match kind {
            AttachmentType::Image => IMAGE_MIME_TYPES,
            AttachmentType::Video => VIDEO_MIME_TYPES,
            AttachmentType::Document => DOCUMENT_MIME_TYPES,
        };
        allowed.contains(&mime.as_str())
    }

    pub fn max_size_for_type(&self, kind: AttachmentType) -> u64 {
        match kind {
            AttachmentType::Image => self.limits.max_image_bytes,
            AttachmentType::Video => self.limits.max_video_bytes,
            AttachmentType::Document => self.limits.max_document_bytes,
        }
    }

    pub fn limits(&self) -> &AttachmentLimits {
        &self.limits
    }
}

pub fn validate_alt_text(alt_text: &str) -> Result<(), ValidationError> {
    let trimmed = alt_text.trim();
    if trimmed.chars().count() > MAX_ALT_TEXT_CHARS {
        return Err(ValidationError::AltTextTooLong);
    }
    if trimmed.contains('<') || trimmed.contains('>') {
        return Err(ValidationError::AltTextMarkup);
    }
    Ok(())
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}
