//! Core identifier and lifecycle types.

use serde::{Deserialize, Serialize};

/// Database identifier type used across the workspace.
pub type Id = i64;

/// Declared attachment category, derived from the client's MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentType {
    Image,
    Video,
    Document,
}

impl AttachmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Document => "DOCUMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IMAGE" => Some(Self::Image),
            "VIDEO" => Some(Self::Video),
            "DOCUMENT" => Some(Self::Document),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttachmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attachment lifecycle status.
///
/// `Uploading` is the only state with outgoing transitions triggered by
/// clients; everything else is owned by the lifecycle service and the
/// expiry sweeper. `Failed`, `Quarantined`, and `Expired` are terminal for
/// content: the row survives, the bytes do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentStatus {
    Uploading,
    Ready,
    Quarantined,
    Failed,
    Expired,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "UPLOADING",
            Self::Ready => "READY",
            Self::Quarantined => "QUARANTINED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPLOADING" => Some(Self::Uploading),
            "READY" => Some(Self::Ready),
            "QUARANTINED" => Some(Self::Quarantined),
            "FAILED" => Some(Self::Failed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether automatic processing is finished for this attachment.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Uploading)
    }

    /// Whether the blob is gone for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Quarantined | Self::Expired)
    }

    /// Valid transitions of the lifecycle state machine.
    ///
    /// `Uploading -> Ready | Quarantined | Failed`, and
    /// `Ready | Quarantined -> Expired` (time-driven). `Failed -> Uploading`
    /// covers the capped client-retry resurrection path.
    pub fn can_transition_to(&self, next: AttachmentStatus) -> bool {
        use AttachmentStatus::*;
        matches!(
            (self, next),
            (Uploading, Ready)
                | (Uploading, Quarantined)
                | (Uploading, Failed)
                | (Uploading, Expired)
                | (Ready, Expired)
                | (Quarantined, Expired)
                | (Failed, Uploading)
        )
    }
}

impl std::fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
