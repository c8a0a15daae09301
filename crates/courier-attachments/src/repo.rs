//! Repository seams and in-memory implementations.
//!
//! Related data is loaded by explicit query, never by graph traversal;
//! the traits stay narrow on purpose.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::types::{AttachmentStatus, Id};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::{Attachment, UploadSession};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Row not found")]
    NotFound,
    #[error("Backend error: {0}")]
    Backend(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait AttachmentRepo: Send + Sync {
    async fn create(&self, attachment: &mut Attachment) -> RepositoryResult<Id>;

    async fn find(&self, id: Id) -> RepositoryResult<Option<Attachment>>;

    async fn update(&self, attachment: &Attachment) -> RepositoryResult<()>;

    /// READY or QUARANTINED attachments whose expiry has passed.
    async fn find_expired(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Attachment>>;
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn create(&self, session: &UploadSession) -> RepositoryResult<()>;

    /// Owner-scoped lookup. A session belonging to someone else is
    /// indistinguishable from a missing one.
    async fn find_for_owner(&self, id: &str, owner_id: Id) -> RepositoryResult<Option<UploadSession>>;

    async fn update(&self, session: &UploadSession) -> RepositoryResult<()>;

    /// Live (non-completed) sessions held by one owner; backs the
    /// pending-upload quota.
    async fn count_live_for_owner(&self, owner_id: Id) -> RepositoryResult<usize>;

    /// Live sessions created before the cutoff; backs the
    /// abandoned-session sweep.
    async fn find_stale_live(&self, cutoff: DateTime<Utc>) -> RepositoryResult<Vec<UploadSession>>;
}

/// In-memory attachment repository for tests and standalone wiring.
pub struct MemoryAttachmentRepo {
    rows: RwLock<Vec<Attachment>>,
    next_id: std::sync::atomic::AtomicI64,
}

impl Default for MemoryAttachmentRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAttachmentRepo {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl AttachmentRepo for MemoryAttachmentRepo {
    async fn create(&self, attachment: &mut Attachment) -> RepositoryResult<Id> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        attachment.id = Some(id);
        self.rows.write().await.push(attachment.clone());
        Ok(id)
    }

    async fn find(&self, id: Id) -> RepositoryResult<Option<Attachment>> {
        let rows = self.rows.read().await;
        Ok(rows.iter().find(|a| a.id == Some(id)).cloned())
    }

    async fn update(&self, attachment: &Attachment) -> RepositoryResult<()> {
        let mut rows = self.rows.write().await;
        match rows.iter().position(|a| a.id == attachment.id) {
            Some(pos) => {
                rows[pos] = attachment.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Attachment>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|a| {
                matches!(
                    a.status,
                    AttachmentStatus::Ready | AttachmentStatus::Quarantined
                ) && a.is_expired_at(now)
            })
            .cloned()
            .collect())
    }
}

/// In-memory upload-session repository.
#[derive(Default)]
pub struct MemorySessionRepo {
    rows: RwLock<Vec<UploadSession>>,
}

impl MemorySessionRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepo for MemorySessionRepo {
    async fn create(&self, session: &UploadSession) -> RepositoryResult<()> {
        self.rows.write().await.push(session.clone());
        Ok(())
    }

    async fn find_for_owner(&self, id: &str, owner_id: Id) -> RepositoryResult<Option<UploadSession>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|s| s.id == id && s.owner_id == owner_id)
            .cloned())
    }

    async fn update(&self, session: &UploadSession) -> RepositoryResult<()> {
        let mut rows = self.rows.write().await;
        match rows.iter().position(|s| s.id == session.id) {
            Some(pos) => {
                rows[pos] = session.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn count_live_for_owner(&self, owner_id: Id) -> RepositoryResult<usize> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|s| s.owner_id == owner_id && !s.completed)
            .count())
    }

    async fn find_stale_live(&self, cutoff: DateTime<Utc>) -> RepositoryResult<Vec<UploadSession>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|s| !s.completed && s.created_at < cutoff)
            .cloned()
            .collect())
    }
}
