//! Attachment persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_attachments::{Attachment, AttachmentRepo, RepositoryError, RepositoryResult};
use courier_core::types::{AttachmentStatus, AttachmentType, Id};
use sqlx::{FromRow, PgPool};

use crate::backend;

const SELECT_COLUMNS: &str = r#"
    id, public_id, message_id, kind, mime_type, size_bytes, checksum,
    width, height, duration_seconds, alt_text, original_filename,
    storage_key, thumbnail_key, status, expires_at, created_at, updated_at
"#;

#[derive(Debug, Clone, FromRow)]
struct AttachmentRow {
    id: i64,
    public_id: String,
    message_id: i64,
    kind: String,
    mime_type: String,
    size_bytes: i64,
    checksum: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    duration_seconds: Option<i32>,
    alt_text: Option<String>,
    original_filename: Option<String>,
    storage_key: String,
    thumbnail_key: Option<String>,
    status: String,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AttachmentRow {
    fn into_model(self) -> RepositoryResult<Attachment> {
        let kind = AttachmentType::parse(&self.kind)
            .ok_or_else(|| RepositoryError::Backend(format!("unknown kind: {}", self.kind)))?;
        let status = AttachmentStatus::parse(&self.status)
            .ok_or_else(|| RepositoryError::Backend(format!("unknown status: {}", self.status)))?;
        Ok(Attachment {
            id: Some(self.id),
            public_id: self.public_id,
            message_id: self.message_id,
            kind,
            mime_type: self.mime_type,
            size_bytes: self.size_bytes,
            checksum: self.checksum,
            width: self.width,
            height: self.height,
            duration_seconds: self.duration_seconds,
            alt_text: self.alt_text,
            original_filename: self.original_filename,
            storage_key: self.storage_key,
            thumbnail_key: self.thumbnail_key,
            status,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub struct PgAttachmentRepo {
    pool: PgPool,
}

impl PgAttachmentRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttachmentRepo for PgAttachmentRepo {
    async fn create(&self, attachment: &mut Attachment) -> RepositoryResult<Id> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO attachments (
                public_id, message_id, kind, mime_type, size_bytes, checksum,
                width, height, duration_seconds, alt_text, original_filename,
                storage_key, thumbnail_key, status, expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING id
            "#,
        )
        .bind(&attachment.public_id)
        .bind(attachment.message_id)
        .bind(attachment.kind.as_str())
        .bind(&attachment.mime_type)
        .bind(attachment.size_bytes)
        .bind(&attachment.checksum)
        .bind(attachment.width)
        .bind(attachment.height)
        .bind(attachment.duration_seconds)
        .bind(&attachment.alt_text)
        .bind(&attachment.original_filename)
        .bind(&attachment.storage_key)
        .bind(&attachment.thumbnail_key)
        .bind(attachment.status.as_str())
        .bind(attachment.expires_at)
        .bind(attachment.created_at)
        .bind(attachment.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        attachment.id = Some(id);
        Ok(id)
    }

    async fn find(&self, id: Id) -> RepositoryResult<Option<Attachment>> {
        let row = sqlx::query_as::<_, AttachmentRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM attachments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(AttachmentRow::into_model).transpose()
    }

    async fn update(&self, attachment: &Attachment) -> RepositoryResult<()> {
        let id = attachment.id.ok_or(RepositoryError::NotFound)?;
        let result = sqlx::query(
            r#"
            UPDATE attachments
            SET mime_type = $2, size_bytes = $3, checksum = $4, width = $5,
                height = $6, duration_seconds = $7, alt_text = $8,
                thumbnail_key = $9, status = $10, expires_at = $11, updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&attachment.mime_type)
        .bind(attachment.size_bytes)
        .bind(&attachment.checksum)
        .bind(attachment.width)
        .bind(attachment.height)
        .bind(attachment.duration_seconds)
        .bind(&attachment.alt_text)
        .bind(&attachment.thumbnail_key)
        .bind(attachment.status.as_str())
        .bind(attachment.expires_at)
        .bind(attachment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Attachment>> {
        let rows = sqlx::query_as::<_, AttachmentRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM attachments
            WHERE status IN ('READY', 'QUARANTINED')
              AND expires_at IS NOT NULL AND expires_at < $1
            ORDER BY expires_at
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter().map(AttachmentRow::into_model).collect()
    }
}
