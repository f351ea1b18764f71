use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    events::{EventBus, EventPayload, tenant_for},
    models::{
        self, AliasRepository, AttachmentId, AttachmentRepository, EmailId, EmailRepository,
        NewEmail, PendingAttachmentRow, ResolvedAlias,
    },
    parser,
    storage::{ObjectStore, attachment_key, raw_blob_key},
};

/// End-of-DATA hand-off from the SMTP state machine.
#[derive(Debug)]
pub struct DataResult {
    pub queue_id: Uuid,
    pub from: String,
    pub recipients: Vec<ResolvedAlias>,
    pub raw: Vec<u8>,
}

/// What the FSM reports back to the client: 451 for transient failures
/// (safe to retry, nothing was committed), 554 for permanent ones.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

#[derive(Debug)]
pub struct IngestReceipt {
    pub queue_id: Uuid,
    pub accepted: usize,
}

/// Seam between the SMTP listener and the pipeline.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn ingest(&self, data: DataResult) -> Result<IngestReceipt, IngestError>;
}

/// RCPT-time alias lookup seam.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve_recipient(
        &self,
        address: &str,
    ) -> Result<Option<ResolvedAlias>, models::Error>;
}

#[async_trait]
impl RecipientResolver for AliasRepository {
    async fn resolve_recipient(
        &self,
        address: &str,
    ) -> Result<Option<ResolvedAlias>, models::Error> {
        self.resolve(address).await
    }
}

const MAX_UPLOAD_ATTEMPTS: u32 = 3;
const UPLOAD_BACKOFF: Duration = Duration::from_millis(500);

/// The ingestion pipeline: resolve recipients, parse once, persist one
/// message row per recipient inside a transaction (durable acceptance),
/// then upload attachment bodies concurrently and publish `new_email`.
pub struct Ingestor {
    emails: EmailRepository,
    attachments: AttachmentRepository,
    store: ObjectStore,
    bus: Arc<EventBus>,
}

impl Ingestor {
    pub fn new(pool: PgPool, store: ObjectStore, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            emails: EmailRepository::new(pool.clone()),
            attachments: AttachmentRepository::new(pool),
            store,
            bus,
        })
    }

    async fn ingest_for_recipient(
        &self,
        recipient: &ResolvedAlias,
        parsed: &parser::ParsedEmail,
        data: &DataResult,
    ) -> Result<EmailId, models::Error> {
        let email_id: EmailId = Uuid::new_v4().into();
        let received_at = Utc::now();

        // Parse failures still get a durable, raw-only record.
        let raw_only = parsed.error.is_some();
        let raw_key = raw_only.then(|| raw_blob_key(recipient.user_id, email_id));

        let mut rows = Vec::with_capacity(parsed.attachments.len());
        let mut uploads = Vec::with_capacity(parsed.attachments.len());
        for part in &parsed.attachments {
            let attachment_id: AttachmentId = Uuid::new_v4().into();
            let key = attachment_key(recipient.user_id, email_id, attachment_id);
            rows.push(PendingAttachmentRow {
                id: attachment_id,
                filename: part.filename.clone(),
                content_type: part.content_type.clone(),
                size_bytes: part.data.len() as i64,
                storage_key: key.clone(),
            });
            uploads.push(UploadJob {
                attachment_id,
                key,
                content_type: part.content_type.clone(),
                data: part.data.clone(),
            });
        }

        let new_email = NewEmail {
            id: email_id,
            alias_id: recipient.alias_id,
            sender_addr: parsed
                .sender_addr
                .clone()
                .unwrap_or_else(|| data.from.clone()),
            sender_name: parsed.sender_name.clone(),
            subject: parsed.subject.clone(),
            body_html: parsed.body_html.clone(),
            body_text: parsed.body_text.clone(),
            headers: parsed.headers_json(),
            size_bytes: data.raw.len() as i64,
            raw_blob: raw_key.clone(),
            received_at,
        };

        self.emails.create_received(&new_email, &rows).await?;

        // Committed. Everything from here on is best-effort and must not
        // fail the acceptance.
        if let Some(key) = raw_key {
            self.spawn_raw_upload(key, data.raw.clone());
        }
        for job in uploads {
            self.spawn_attachment_upload(job);
        }

        if let Err(e) = self.bus.publish(
            &tenant_for(recipient.user_id),
            EventPayload::NewEmail {
                email_id,
                alias_id: recipient.alias_id,
                alias_address: recipient.full_address.clone(),
                sender_addr: new_email.sender_addr.clone(),
                subject: new_email.subject.clone(),
                preview: parsed.preview.clone(),
                has_attachments: !parsed.attachments.is_empty(),
            },
        ) {
            error!("could not publish new_email event: {e}");
        }

        Ok(email_id)
    }

    fn spawn_attachment_upload(&self, job: UploadJob) {
        let store = self.store.clone();
        let attachments = self.attachments.clone();

        tokio::spawn(async move {
            let checksum = hex::encode(Sha256::digest(&job.data));
            let mut attempt = 0;

            loop {
                attempt += 1;
                match store
                    .put(&job.key, &job.content_type, job.data.clone())
                    .await
                {
                    Ok(()) => {
                        let url = store.object_url(&job.key);
                        if let Err(e) = attachments
                            .mark_active(job.attachment_id, &checksum, &url)
                            .await
                        {
                            error!(key = job.key, "could not mark attachment active: {e}");
                        }
                        debug!(key = job.key, attempt, "attachment uploaded");
                        return;
                    }
                    Err(e) if attempt < MAX_UPLOAD_ATTEMPTS => {
                        warn!(key = job.key, attempt, "attachment upload failed, retrying: {e}");
                        if let Err(e) = attachments.bump_retry(job.attachment_id, attempt as i32).await
                        {
                            error!(key = job.key, "could not record retry: {e}");
                        }
                        tokio::time::sleep(UPLOAD_BACKOFF * 2u32.pow(attempt - 1)).await;
                    }
                    Err(e) => {
                        error!(key = job.key, "attachment upload failed permanently: {e}");
                        if let Err(e) = attachments
                            .mark_failed(job.attachment_id, &e.to_string(), attempt as i32)
                            .await
                        {
                            error!(key = job.key, "could not mark attachment failed: {e}");
                        }
                        return;
                    }
                }
            }
        });
    }

    fn spawn_raw_upload(&self, key: String, raw: Vec<u8>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            for attempt in 1..=MAX_UPLOAD_ATTEMPTS {
                match store.put(&key, "message/rfc822", raw.clone()).await {
                    Ok(()) => return,
                    Err(e) if attempt < MAX_UPLOAD_ATTEMPTS => {
                        warn!(key, attempt, "raw blob upload failed, retrying: {e}");
                        tokio::time::sleep(UPLOAD_BACKOFF * 2u32.pow(attempt - 1)).await;
                    }
                    Err(e) => error!(key, "raw blob upload failed permanently: {e}"),
                }
            }
        });
    }
}

struct UploadJob {
    attachment_id: AttachmentId,
    key: String,
    content_type: String,
    data: Vec<u8>,
}

#[async_trait]
impl MessageSink for Ingestor {
    async fn ingest(&self, data: DataResult) -> Result<IngestReceipt, IngestError> {
        let parsed = parser::parse(&data.raw);
        if let Some(parse_error) = &parsed.error {
            warn!(
                queue_id = data.queue_id.to_string(),
                stage = ?parse_error.stage,
                "message parse failed, persisting raw-only record: {}",
                parse_error.message
            );
        }

        let mut accepted = 0;
        let mut transient_failure = None;

        for recipient in &data.recipients {
            // Idempotent re-check: the alias may have been deactivated or
            // its domain deleted between RCPT and end-of-DATA.
            if !recipient.accepts_mail() {
                debug!(
                    recipient = recipient.full_address,
                    "recipient no longer accepts mail, skipping"
                );
                continue;
            }

            match self.ingest_for_recipient(recipient, &parsed, &data).await {
                Ok(email_id) => {
                    accepted += 1;
                    info!(
                        queue_id = data.queue_id.to_string(),
                        email_id = email_id.to_string(),
                        recipient = recipient.full_address,
                        size_bytes = data.raw.len(),
                        "message accepted"
                    );
                }
                Err(e) => {
                    error!(
                        recipient = recipient.full_address,
                        "failed to persist message: {e}"
                    );
                    transient_failure = Some(e.to_string());
                }
            }
        }

        if accepted == 0 {
            return Err(match transient_failure {
                Some(reason) => IngestError::Transient(reason),
                None => IngestError::Permanent("no valid recipients remain".to_string()),
            });
        }

        Ok(IngestReceipt {
            queue_id: data.queue_id,
            accepted,
        })
    }
}
