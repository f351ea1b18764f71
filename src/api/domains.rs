use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use garde::Validate;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::{
    api::{
        ApiState,
        auth::AuthUser,
        error::{ApiError, ApiResponse, ApiResult},
    },
    dns::{DnsInstructions, reserved_domain, valid_domain_name},
    events::{EventPayload, tenant_for},
    models::{Domain, DomainCascade, DomainId, DomainRepository},
};

#[derive(Debug, Deserialize, Validate)]
pub struct NewDomainRequest {
    #[garde(length(min = 3, max = 253))]
    name: String,
}

#[derive(Serialize)]
pub struct DomainWithInstructions {
    #[serde(flatten)]
    domain: Domain,
    dns: DnsInstructions,
}

pub async fn list_domains(
    State(repo): State<DomainRepository>,
    user: AuthUser,
) -> ApiResult<Vec<Domain>> {
    let domains = repo.list(user.user_id).await?;

    debug!(
        user_id = user.user_id.to_string(),
        "listed {} domains",
        domains.len()
    );

    Ok(ApiResponse(domains))
}

pub async fn create_domain(
    State(state): State<ApiState>,
    user: AuthUser,
    Json(request): Json<NewDomainRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;

    let name = request.name.trim().trim_end_matches('.').to_lowercase();
    if !valid_domain_name(&name) {
        return Err(ApiError::Validation("not a valid domain name".to_string()));
    }
    if reserved_domain(&name) {
        return Err(ApiError::Validation("this domain is reserved".to_string()));
    }

    let repo = DomainRepository::new(state.pool.clone());
    if repo.count_for_user(user.user_id).await? >= state.config.max_domains_per_user {
        return Err(ApiError::DomainLimitReached);
    }

    let domain = repo
        .create(user.user_id, &name)
        .await
        .map_err(|e| match e {
            crate::models::Error::Conflict => ApiError::Conflict("domain"),
            e => e.into(),
        })?;

    info!(
        user_id = user.user_id.to_string(),
        domain_id = domain.id().to_string(),
        domain = domain.name(),
        "created domain"
    );

    let dns = state
        .verifier
        .instructions(domain.name(), domain.verification_token());

    Ok((
        StatusCode::CREATED,
        ApiResponse(DomainWithInstructions { domain, dns }),
    ))
}

#[derive(Serialize)]
pub struct VerifyResponse {
    verified: bool,
    mx_record_found: bool,
    txt_record_found: bool,
    domain: Domain,
}

/// Probes MX + TXT and flips the domain to verified when both pass.
/// Verification is all-or-nothing; a failed probe reports which checks
/// came up short. Rate-limited per domain.
pub async fn verify_domain(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(domain_id): Path<DomainId>,
) -> ApiResult<VerifyResponse> {
    let repo = DomainRepository::new(state.pool.clone());
    let domain = repo.get(user.user_id, domain_id).await?;

    if !state.verify_rate.allow(domain_id) {
        return Err(ApiError::RateLimited);
    }

    if domain.is_verified() {
        return Ok(ApiResponse(VerifyResponse {
            verified: true,
            mx_record_found: true,
            txt_record_found: true,
            domain,
        }));
    }

    let outcome = state
        .verifier
        .verify(domain.name(), domain.verification_token())
        .await;

    if !outcome.verified {
        debug!(
            domain = domain.name(),
            mx = outcome.mx_record_found,
            txt = outcome.txt_record_found,
            "verification failed"
        );
        return Err(ApiError::VerificationFailed(json!({
            "mx_record_found": outcome.mx_record_found,
            "txt_record_found": outcome.txt_record_found,
            "checked_at": outcome.checked_at,
        })));
    }

    let domain = repo.mark_verified(domain_id).await?;

    info!(
        user_id = user.user_id.to_string(),
        domain = domain.name(),
        "domain verified"
    );

    if let Err(e) = state.bus.publish(
        &tenant_for(user.user_id),
        EventPayload::DomainVerified {
            domain_id: domain.id(),
            name: domain.name().to_string(),
        },
    ) {
        debug!("could not publish domain_verified: {e}");
    }

    // certificate provisioning kicks off in the background
    state.certs.enqueue(domain.id(), domain.name());

    Ok(ApiResponse(VerifyResponse {
        verified: true,
        mx_record_found: true,
        txt_record_found: true,
        domain,
    }))
}

#[derive(Serialize)]
pub struct DomainDeleted {
    domain_id: DomainId,
    #[serde(flatten)]
    cascade: DomainCascade,
}

pub async fn remove_domain(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(domain_id): Path<DomainId>,
) -> ApiResult<DomainDeleted> {
    let repo = DomainRepository::new(state.pool.clone());
    let domain = repo.get(user.user_id, domain_id).await?;
    let name = domain.name().to_string();

    let cascade = repo.remove(user.user_id, domain_id).await?;

    info!(
        user_id = user.user_id.to_string(),
        domain = name,
        aliases = cascade.aliases,
        emails = cascade.emails,
        "deleted domain"
    );

    state.certs.sni().remove(&name);

    if let Err(e) = state.bus.publish(
        &tenant_for(user.user_id),
        EventPayload::DomainDeleted {
            domain_id,
            name: name.clone(),
        },
    ) {
        debug!("could not publish domain_deleted: {e}");
    }

    Ok(ApiResponse(DomainDeleted { domain_id, cascade }))
}
