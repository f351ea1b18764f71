use axum::extract::{Path, Query, State};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    api::{
        ApiState,
        auth::AuthUser,
        error::{ApiResponse, ApiResult},
    },
    events::{EventPayload, tenant_for},
    models::{
        Attachment, AttachmentId, AttachmentRepository, Email, EmailFilter, EmailId, EmailPage,
        EmailRepository,
    },
};

pub async fn list_emails(
    State(repo): State<EmailRepository>,
    user: AuthUser,
    Query(filter): Query<EmailFilter>,
) -> ApiResult<EmailPage> {
    let page = repo.list(user.user_id, &filter).await?;

    debug!(
        user_id = user.user_id.to_string(),
        total = page.total,
        "listed inbox"
    );

    Ok(ApiResponse(page))
}

#[derive(Serialize)]
pub struct EmailWithAttachments {
    #[serde(flatten)]
    email: Email,
    attachments: Vec<Attachment>,
}

pub async fn get_email(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(email_id): Path<EmailId>,
) -> ApiResult<EmailWithAttachments> {
    let emails = EmailRepository::new(state.pool.clone());
    let attachments = AttachmentRepository::new(state.pool.clone());

    let email = emails.get(user.user_id, email_id).await?;
    let attachments = attachments.list_for_email(email_id).await?;

    Ok(ApiResponse(EmailWithAttachments { email, attachments }))
}

#[derive(Serialize)]
pub struct MarkedRead {
    email_id: EmailId,
    is_read: bool,
}

pub async fn mark_read(
    State(repo): State<EmailRepository>,
    user: AuthUser,
    Path(email_id): Path<EmailId>,
) -> ApiResult<MarkedRead> {
    repo.mark_read(user.user_id, email_id).await?;

    Ok(ApiResponse(MarkedRead {
        email_id,
        is_read: true,
    }))
}

#[derive(Serialize)]
pub struct EmailDeleted {
    email_id: EmailId,
}

/// Row deletion is child-first in one transaction; the freed object-store
/// keys are deleted afterwards, off the request path.
pub async fn remove_email(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(email_id): Path<EmailId>,
) -> ApiResult<EmailDeleted> {
    let repo = EmailRepository::new(state.pool.clone());
    let freed = repo.remove(user.user_id, email_id).await?;

    info!(
        user_id = user.user_id.to_string(),
        email_id = email_id.to_string(),
        objects = freed.keys.len(),
        "deleted email"
    );

    let store = state.store.clone();
    tokio::spawn(async move {
        for key in freed.keys {
            if let Err(e) = store.delete(&key).await {
                tracing::warn!(key, "deferred object deletion failed: {e}");
            }
        }
    });

    if let Err(e) = state.bus.publish(
        &tenant_for(user.user_id),
        EventPayload::EmailDeleted { email_id },
    ) {
        debug!("could not publish email_deleted: {e}");
    }

    Ok(ApiResponse(EmailDeleted { email_id }))
}

#[derive(Serialize)]
pub struct DownloadUrl {
    url: String,
    expires_in_seconds: u64,
}

/// Hands out a presigned, time-limited URL for one attachment object.
pub async fn download_attachment(
    State(state): State<ApiState>,
    user: AuthUser,
    Path((email_id, attachment_id)): Path<(EmailId, AttachmentId)>,
) -> ApiResult<DownloadUrl> {
    let attachments = AttachmentRepository::new(state.pool.clone());
    let attachment = attachments.get(user.user_id, attachment_id).await?;

    // the path names the message; make sure they belong together
    if attachment.storage_key() != crate::storage::attachment_key(user.user_id, email_id, attachment_id)
    {
        return Err(crate::api::error::ApiError::NotFound);
    }

    let url = state.store.presign_get(attachment.storage_key()).await?;

    Ok(ApiResponse(DownloadUrl {
        url,
        expires_in_seconds: state.config.presign_ttl_seconds,
    }))
}
