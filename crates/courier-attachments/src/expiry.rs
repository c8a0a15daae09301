//! Background expiry sweep.
//!
//! Two jobs on one timer: retire READY/QUARANTINED attachments whose
//! expiry has passed (deleting their blobs), and cancel upload sessions
//! abandoned past the staleness cutoff. Every row is handled on its own;
//! one bad row never stalls the sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use courier_core::config::AttachmentLimits;
use courier_core::events::UpdatePublisher;
use courier_core::types::AttachmentStatus;
use courier_storage::BlobStore;
use tracing::{info, instrument, warn};

use crate::repo::{AttachmentRepo, SessionRepo};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub sessions_cancelled: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct ExpirySweeper {
    attachments: Arc<dyn AttachmentRepo>,
    sessions: Arc<dyn SessionRepo>,
    store: BlobStore,
    publisher: Arc<dyn UpdatePublisher>,
    interval_secs: u64,
    session_max_age_secs: u64,
}

impl ExpirySweeper {
    pub fn new(
        attachments: Arc<dyn AttachmentRepo>,
        sessions: Arc<dyn SessionRepo>,
        store: BlobStore,
        publisher: Arc<dyn UpdatePublisher>,
        limits: &AttachmentLimits,
    ) -> Self {
        Self {
            attachments,
            sessions,
            store,
            publisher,
            interval_secs: limits.expiry_sweep_secs,
            session_max_age_secs: limits.session_max_age_secs,
        }
    }

    /// Run sweeps forever on the configured interval. Spawned once at
    /// startup.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(self.interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let stats = self.run_once().await;
                if stats != SweepStats::default() {
                    info!(
                        expired = stats.expired,
                        sessions_cancelled = stats.sessions_cancelled,
                        errors = stats.errors,
                        "Expiry sweep finished"
                    );
                }
            }
        })
    }

    /// One full sweep pass.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let now = Utc::now();

        match self.attachments.find_expired(now).await {
            Ok(expired) => {
                for mut attachment in expired {
                    if !attachment.transition(AttachmentStatus::Expired) {
                        continue;
                    }
                    if let Err(err) = self.attachments.update(&attachment).await {
                        warn!(attachment_id = attachment.id, error = %err, "Expiry update failed");
                        stats.errors += 1;
                        continue;
                    }
                    // blobs go best-effort; the status flip is what matters
                    if let Err(err) = self.store.delete_permanent(&attachment.storage_key).await {
                        warn!(attachment_id = attachment.id, error = %err, "Blob delete failed");
                        stats.errors += 1;
                    }
                    if let Some(key) = &attachment.thumbnail_key {
                        if let Err(err) = self.store.delete_thumbnail(key).await {
                            warn!(attachment_id = attachment.id, error = %err, "Thumbnail delete failed");
                            stats.errors += 1;
                        }
                    }
                    if let Err(err) = self.publisher.message_updated(attachment.message_id).await {
                        warn!(attachment_id = attachment.id, error = %err, "Realtime publish failed");
                    }
                    stats.expired += 1;
                }
            }
            Err(err) => {
                warn!(error = %err, "Expired-attachment query failed");
                stats.errors += 1;
            }
        }

        let cutoff = now - Duration::seconds(self.session_max_age_secs as i64);
        match self.sessions.find_stale_live(cutoff).await {
            Ok(stale) => {
                for mut session in stale {
                    session.complete(Some("Abandoned"));
                    if let Err(err) = self.sessions.update(&session).await {
                        warn!(upload_id = %session.id, error = %err, "Stale-session update failed");
                        stats.errors += 1;
                        continue;
                    }
                    if let Err(err) = self.store.delete_temp(&session.temp_key).await {
                        warn!(upload_id = %session.id, error = %err, "Temp scrub failed");
                        stats.errors += 1;
                    }
                    if let Ok(Some(mut attachment)) =
                        self.attachments.find(session.attachment_id).await
                    {
                        if attachment.status == AttachmentStatus::Uploading {
                            attachment.transition(AttachmentStatus::Failed);
                            if let Err(err) = self.attachments.update(&attachment).await {
                                warn!(attachment_id = attachment.id, error = %err, "Abandon update failed");
                                stats.errors += 1;
                            }
                        }
                    }
                    stats.sessions_cancelled += 1;
                }
            }
            Err(err) => {
                warn!(error = %err, "Stale-session query failed");
                stats.errors += 1;
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attachment, UploadSession};
    use crate::repo::{MemoryAttachmentRepo, MemorySessionRepo};
    use courier_core::config::StorageConfig;
    use courier_core::events::MemoryPublisher;
    use courier_core::types::AttachmentType;
    use tempfile::TempDir;

    struct Fixture {
        sweeper: ExpirySweeper,
        attachments: Arc<MemoryAttachmentRepo>,
        sessions: Arc<MemorySessionRepo>,
        store: BlobStore,
        publisher: Arc<MemoryPublisher>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        let store = BlobStore::new(&StorageConfig {
            permanent_dir: format!("{root}/perm"),
            temp_dir: format!("{root}/tmp"),
            quarantine_dir: format!("{root}/quarantine"),
            thumbnail_dir: format!("{root}/thumbs"),
        });
        store.init().await.unwrap();

        let attachments = Arc::new(MemoryAttachmentRepo::new());
        let sessions = Arc::new(MemorySessionRepo::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let sweeper = ExpirySweeper::new(
            attachments.clone(),
            sessions.clone(),
            store.clone(),
            publisher.clone(),
            &AttachmentLimits::default(),
        );
        Fixture {
            sweeper,
            attachments,
            sessions,
            store,
            publisher,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_expired_ready_attachment_is_retired() {
        let f = fixture().await;
        let tmp = f._dir.path().join("blob.bin");
        tokio::fs::write(&tmp, b"payload").await.unwrap();
        f.store.store_permanent(&tmp, "expired-key").await.unwrap();

        let mut attachment =
            Attachment::new(1, AttachmentType::Image, "image/png", 7, "expired-key");
        attachment.status = AttachmentStatus::Ready;
        attachment.expires_at = Some(Utc::now() - Duration::minutes(5));
        let id = f.attachments.create(&mut attachment).await.unwrap();

        let stats = f.sweeper.run_once().await;
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.errors, 0);

        let swept = f.attachments.find(id).await.unwrap().unwrap();
        assert_eq!(swept.status, AttachmentStatus::Expired);
        assert!(!f.store.permanent_exists("expired-key").await.unwrap());
        assert_eq!(f.publisher.published().await, vec![swept.message_id]);
    }

    #[tokio::test]
    async fn test_unexpired_rows_are_left_alone() {
        let f = fixture().await;
        let mut attachment = Attachment::new(1, AttachmentType::Image, "image/png", 7, "k");
        attachment.status = AttachmentStatus::Ready;
        attachment.expires_at = Some(Utc::now() + Duration::hours(1));
        let id = f.attachments.create(&mut attachment).await.unwrap();

        let stats = f.sweeper.run_once().await;
        assert_eq!(stats, SweepStats::default());
        assert_eq!(
            f.attachments.find(id).await.unwrap().unwrap().status,
            AttachmentStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_abandoned_session_is_cancelled() {
        let f = fixture().await;
        let mut attachment = Attachment::new(1, AttachmentType::Image, "image/png", 7, "k");
        let id = f.attachments.create(&mut attachment).await.unwrap();

        let mut session = UploadSession::new(id, 1, 7, "stale-tmp");
        session.created_at = Utc::now() - Duration::days(2);
        f.store.ensure_temp_dir("stale-tmp").await.unwrap();
        f.store.write_chunk("stale-tmp", 0, b"part").await.unwrap();
        f.sessions.create(&session).await.unwrap();

        let stats = f.sweeper.run_once().await;
        assert_eq!(stats.sessions_cancelled, 1);

        let swept = f.sessions.find_for_owner(&session.id, 1).await.unwrap().unwrap();
        assert!(swept.completed);
        assert_eq!(swept.last_error.as_deref(), Some("Abandoned"));
        assert_eq!(
            f.attachments.find(id).await.unwrap().unwrap().status,
            AttachmentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_fresh_session_survives_sweep() {
        let f = fixture().await;
        let session = UploadSession::new(1, 1, 7, "fresh-tmp");
        f.sessions.create(&session).await.unwrap();

        let stats = f.sweeper.run_once().await;
        assert_eq!(stats.sessions_cancelled, 0);
        let kept = f.sessions.find_for_owner(&session.id, 1).await.unwrap().unwrap();
        assert!(!kept.completed);
    }
}
