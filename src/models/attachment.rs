use crate::models::{EmailId, Error, UserId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct AttachmentId(Uuid);

impl AttachmentId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "attachment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    Pending,
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Attachment {
    id: AttachmentId,
    message_id: EmailId,
    filename: String,
    content_type: String,
    size_bytes: i64,
    storage_key: String,
    storage_url: Option<String>,
    checksum: Option<String>,
    status: AttachmentStatus,
    error_details: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn id(&self) -> AttachmentId {
        self.id
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn status(&self) -> AttachmentStatus {
        self.status
    }
}

#[derive(Clone)]
pub struct AttachmentRepository {
    pool: sqlx::PgPool,
}

impl AttachmentRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_for_email(&self, message_id: EmailId) -> Result<Vec<Attachment>, Error> {
        sqlx::query_as::<_, Attachment>(
            r#"
            SELECT id, message_id, filename, content_type, size_bytes, storage_key, storage_url,
                   checksum, status, error_details, retry_count, created_at
            FROM attachments
            WHERE message_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Ownership-gated single attachment lookup (for downloads).
    pub async fn get(&self, user: UserId, id: AttachmentId) -> Result<Attachment, Error> {
        sqlx::query_as::<_, Attachment>(
            r#"
            SELECT t.id, t.message_id, t.filename, t.content_type, t.size_bytes, t.storage_key,
                   t.storage_url, t.checksum, t.status, t.error_details, t.retry_count, t.created_at
            FROM attachments t
            JOIN emails e ON t.message_id = e.id
            JOIN aliases a ON e.alias_id = a.id
            WHERE t.id = $1 AND a.user_id = $2
            "#,
        )
        .bind(id)
        .bind(user)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("attachment"))
    }

    /// Upload confirmed: `pending -> active`, checksum and URL recorded.
    pub async fn mark_active(
        &self,
        id: AttachmentId,
        checksum: &str,
        storage_url: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE attachments
            SET status = 'active', checksum = $2, storage_url = $3, error_details = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(checksum)
        .bind(storage_url)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retries exhausted: `pending -> failed` with the last error kept.
    pub async fn mark_failed(
        &self,
        id: AttachmentId,
        error_details: &str,
        retry_count: i32,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE attachments
            SET status = 'failed', error_details = $2, retry_count = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_details)
        .bind(retry_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn bump_retry(&self, id: AttachmentId, retry_count: i32) -> Result<(), Error> {
        sqlx::query("UPDATE attachments SET retry_count = $2 WHERE id = $1")
            .bind(id)
            .bind(retry_count)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
