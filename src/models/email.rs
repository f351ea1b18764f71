use crate::models::{AliasId, Error, UserId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct EmailId(Uuid);

impl EmailId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// A received message. Rows are created exclusively by the ingestion
/// pipeline; `size_bytes` is the length of the raw wire message.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Email {
    id: EmailId,
    alias_id: AliasId,
    sender_addr: String,
    sender_name: Option<String>,
    subject: Option<String>,
    body_html: Option<String>,
    body_text: Option<String>,
    headers: serde_json::Value,
    size_bytes: i64,
    is_read: bool,
    raw_blob: Option<String>,
    received_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl Email {
    pub fn id(&self) -> EmailId {
        self.id
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn body_text(&self) -> Option<&str> {
        self.body_text.as_deref()
    }

    /// Case-insensitive header lookup; keys keep their original case in
    /// the stored map.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_object().and_then(|map| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.as_str())
        })
    }
}

#[derive(Debug)]
pub struct NewEmail {
    pub id: EmailId,
    pub alias_id: AliasId,
    pub sender_addr: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub headers: serde_json::Value,
    pub size_bytes: i64,
    pub raw_blob: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailSort {
    #[default]
    ReceivedAt,
    SizeBytes,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EmailFilter {
    pub alias_id: Option<AliasId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub is_read: Option<bool>,
    pub search: Option<String>,
    pub has_attachments: Option<bool>,
    pub sort: EmailSort,
    pub order: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for EmailFilter {
    fn default() -> Self {
        Self {
            alias_id: None,
            since: None,
            until: None,
            is_read: None,
            search: None,
            has_attachments: None,
            sort: EmailSort::default(),
            order: SortOrder::default(),
            limit: 50,
            offset: 0,
        }
    }
}

impl EmailFilter {
    fn order_by(&self) -> &'static str {
        match (self.sort, self.order) {
            (EmailSort::ReceivedAt, SortOrder::Desc) => "e.received_at DESC, e.id",
            (EmailSort::ReceivedAt, SortOrder::Asc) => "e.received_at ASC, e.id",
            (EmailSort::SizeBytes, SortOrder::Desc) => "e.size_bytes DESC, e.id",
            (EmailSort::SizeBytes, SortOrder::Asc) => "e.size_bytes ASC, e.id",
        }
    }
}

/// Listing row: metadata only, bodies are fetched per message.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct EmailSummary {
    pub id: EmailId,
    pub alias_id: AliasId,
    pub alias_address: String,
    pub sender_addr: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub size_bytes: i64,
    pub is_read: bool,
    pub has_attachments: bool,
    pub received_at: DateTime<Utc>,
    #[serde(skip)]
    pub total_count: i64,
}

#[derive(Debug, Serialize)]
pub struct EmailPage {
    pub emails: Vec<EmailSummary>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Object-store keys freed by a message deletion.
#[derive(Debug, Default)]
pub struct FreedBlobs {
    pub keys: Vec<String>,
}

#[derive(Clone)]
pub struct EmailRepository {
    pool: sqlx::PgPool,
}

impl EmailRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Durable acceptance: the message row and all attachment rows (in
    /// `pending` state) commit in one transaction. Uploads happen after.
    pub async fn create_received(
        &self,
        email: &NewEmail,
        attachments: &[PendingAttachmentRow],
    ) -> Result<EmailId, Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO emails
                (id, alias_id, sender_addr, sender_name, subject, body_html, body_text,
                 headers, size_bytes, is_read, raw_blob, received_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10, $11, NOW())
            "#,
        )
        .bind(email.id)
        .bind(email.alias_id)
        .bind(&email.sender_addr)
        .bind(&email.sender_name)
        .bind(&email.subject)
        .bind(&email.body_html)
        .bind(&email.body_text)
        .bind(&email.headers)
        .bind(email.size_bytes)
        .bind(&email.raw_blob)
        .bind(email.received_at)
        .execute(&mut *tx)
        .await?;

        for attachment in attachments {
            sqlx::query(
                r#"
                INSERT INTO attachments
                    (id, message_id, filename, content_type, size_bytes, storage_key,
                     status, retry_count, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, NOW())
                "#,
            )
            .bind(attachment.id)
            .bind(email.id)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(attachment.size_bytes)
            .bind(&attachment.storage_key)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(email.id)
    }

    pub async fn list(&self, user: UserId, filter: &EmailFilter) -> Result<EmailPage, Error> {
        let limit = filter.limit.clamp(1, MAX_PAGE_SIZE);
        let offset = filter.offset.max(0);

        // Everything except the sort column is bound; the ORDER BY clause
        // comes from a closed set above.
        let query = format!(
            r#"
            SELECT e.id, e.alias_id, a.full_address AS alias_address, e.sender_addr,
                   e.sender_name, e.subject, e.size_bytes, e.is_read,
                   EXISTS(SELECT 1 FROM attachments t WHERE t.message_id = e.id) AS has_attachments,
                   e.received_at,
                   COUNT(*) OVER () AS total_count
            FROM emails e
            JOIN aliases a ON e.alias_id = a.id
            WHERE a.user_id = $1
              AND ($2::uuid IS NULL OR e.alias_id = $2)
              AND ($3::timestamptz IS NULL OR e.received_at >= $3)
              AND ($4::timestamptz IS NULL OR e.received_at <= $4)
              AND ($5::boolean IS NULL OR e.is_read = $5)
              AND ($6::text IS NULL
                   OR e.subject ILIKE '%' || $6 || '%'
                   OR e.sender_addr ILIKE '%' || $6 || '%'
                   OR e.body_text ILIKE '%' || $6 || '%')
              AND ($7::boolean IS NULL
                   OR EXISTS(SELECT 1 FROM attachments t WHERE t.message_id = e.id) = $7)
            ORDER BY {}
            LIMIT $8 OFFSET $9
            "#,
            filter.order_by()
        );

        let rows = sqlx::query_as::<_, EmailSummary>(&query)
            .bind(user)
            .bind(filter.alias_id)
            .bind(filter.since)
            .bind(filter.until)
            .bind(filter.is_read)
            .bind(&filter.search)
            .bind(filter.has_attachments)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let total = rows.first().map(|r| r.total_count).unwrap_or(0);

        Ok(EmailPage {
            emails: rows,
            total,
            limit,
            offset,
        })
    }

    pub async fn get(&self, user: UserId, id: EmailId) -> Result<Email, Error> {
        sqlx::query_as::<_, Email>(
            r#"
            SELECT e.id, e.alias_id, e.sender_addr, e.sender_name, e.subject, e.body_html,
                   e.body_text, e.headers, e.size_bytes, e.is_read, e.raw_blob,
                   e.received_at, e.created_at
            FROM emails e
            JOIN aliases a ON e.alias_id = a.id
            WHERE e.id = $1 AND a.user_id = $2
            "#,
        )
        .bind(id)
        .bind(user)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("email"))
    }

    /// The ownership gate used before any per-message mutation.
    pub async fn owned_by(&self, user: UserId, id: EmailId) -> Result<bool, Error> {
        let owned: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM emails e JOIN aliases a ON e.alias_id = a.id
                WHERE e.id = $1 AND a.user_id = $2
            )
            "#,
        )
        .bind(id)
        .bind(user)
        .fetch_one(&self.pool)
        .await?;

        Ok(owned)
    }

    /// Bulk variant: reduces a caller-supplied id list to the ids the
    /// user actually owns.
    pub async fn filter_owned(
        &self,
        user: UserId,
        ids: &[EmailId],
    ) -> Result<Vec<EmailId>, Error> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();

        sqlx::query_scalar::<_, EmailId>(
            r#"
            SELECT e.id FROM emails e JOIN aliases a ON e.alias_id = a.id
            WHERE e.id = ANY($1) AND a.user_id = $2
            "#,
        )
        .bind(&ids)
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn mark_read(&self, user: UserId, id: EmailId) -> Result<(), Error> {
        let updated = sqlx::query(
            r#"
            UPDATE emails SET is_read = TRUE
            WHERE id = $1
              AND EXISTS(SELECT 1 FROM aliases a WHERE a.id = emails.alias_id AND a.user_id = $2)
            "#,
        )
        .bind(id)
        .bind(user)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound("email"));
        }

        Ok(())
    }

    /// Child-first delete inside one transaction; returns the object-store
    /// keys (attachments + raw blob) for post-commit deletion.
    pub async fn remove(&self, user: UserId, id: EmailId) -> Result<FreedBlobs, Error> {
        let mut tx = self.pool.begin().await?;

        let owned: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM emails e JOIN aliases a ON e.alias_id = a.id
                WHERE e.id = $1 AND a.user_id = $2
            )
            "#,
        )
        .bind(id)
        .bind(user)
        .fetch_one(&mut *tx)
        .await?;

        if !owned {
            return Err(Error::NotFound("email"));
        }

        let mut keys: Vec<String> =
            sqlx::query_scalar("DELETE FROM attachments WHERE message_id = $1 RETURNING storage_key")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

        let raw_blob: Option<String> =
            sqlx::query_scalar("DELETE FROM emails WHERE id = $1 RETURNING raw_blob")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        keys.extend(raw_blob);

        Ok(FreedBlobs { keys })
    }
}

/// Attachment metadata inserted in `pending` state alongside the message
/// row; bodies are uploaded after the commit.
#[derive(Debug)]
pub struct PendingAttachmentRow {
    pub id: crate::models::AttachmentId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
}
