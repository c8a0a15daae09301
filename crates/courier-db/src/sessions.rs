//! Upload-session persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_attachments::{RepositoryError, RepositoryResult, SessionRepo, UploadSession};
use courier_core::types::Id;
use sqlx::{FromRow, PgPool};

use crate::backend;

const SELECT_COLUMNS: &str = r#"
    id, attachment_id, owner_id, expected_bytes, total_chunks, uploaded_chunks,
    temp_key, completed, last_error, retry_count, created_at, updated_at
"#;

#[derive(Debug, Clone, FromRow)]
struct SessionRow {
    id: String,
    attachment_id: i64,
    owner_id: i64,
    expected_bytes: i64,
    total_chunks: i32,
    uploaded_chunks: i32,
    temp_key: String,
    completed: bool,
    last_error: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionRow {
    fn into_model(self) -> UploadSession {
        UploadSession {
            id: self.id,
            attachment_id: self.attachment_id,
            owner_id: self.owner_id,
            expected_bytes: self.expected_bytes,
            total_chunks: self.total_chunks.max(0) as u32,
            uploaded_chunks: self.uploaded_chunks.max(0) as u32,
            temp_key: self.temp_key,
            completed: self.completed,
            last_error: self.last_error,
            retry_count: self.retry_count.max(0) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub struct PgSessionRepo {
    pool: PgPool,
}

impl PgSessionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepo for PgSessionRepo {
    async fn create(&self, session: &UploadSession) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, attachment_id, owner_id, expected_bytes, total_chunks,
                uploaded_chunks, temp_key, completed, last_error, retry_count,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&session.id)
        .bind(session.attachment_id)
        .bind(session.owner_id)
        .bind(session.expected_bytes)
        .bind(session.total_chunks as i32)
        .bind(session.uploaded_chunks as i32)
        .bind(&session.temp_key)
        .bind(session.completed)
        .bind(&session.last_error)
        .bind(session.retry_count as i32)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn find_for_owner(&self, id: &str, owner_id: Id) -> RepositoryResult<Option<UploadSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM upload_sessions WHERE id = $1 AND owner_id = $2"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(row.map(SessionRow::into_model))
    }

    async fn update(&self, session: &UploadSession) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET total_chunks = $2, uploaded_chunks = $3, completed = $4,
                last_error = $5, retry_count = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&session.id)
        .bind(session.total_chunks as i32)
        .bind(session.uploaded_chunks as i32)
        .bind(session.completed)
        .bind(&session.last_error)
        .bind(session.retry_count as i32)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn count_live_for_owner(&self, owner_id: Id) -> RepositoryResult<usize> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM upload_sessions WHERE owner_id = $1 AND completed = FALSE",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(count.max(0) as usize)
    }

    async fn find_stale_live(&self, cutoff: DateTime<Utc>) -> RepositoryResult<Vec<UploadSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM upload_sessions
            WHERE completed = FALSE AND created_at < $1
            ORDER BY created_at
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows.into_iter().map(SessionRow::into_model).collect())
    }
}
