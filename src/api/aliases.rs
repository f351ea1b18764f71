use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use garde::Validate;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    api::{
        ApiState,
        auth::AuthUser,
        error::{ApiError, ApiResponse, ApiResult},
    },
    events::{EventPayload, tenant_for},
    models::{Alias, AliasCascade, AliasId, AliasRepository, AliasUpdate, DomainId},
};

#[derive(Debug, Deserialize, Validate)]
pub struct NewAliasRequest {
    #[garde(skip)]
    domain_id: DomainId,
    #[garde(pattern(r"^[a-zA-Z0-9._%+-]{1,64}$"))]
    local_part: String,
    #[garde(inner(length(max = 500)))]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AliasListQuery {
    domain_id: Option<DomainId>,
}

pub async fn list_aliases(
    State(repo): State<AliasRepository>,
    user: AuthUser,
    Query(query): Query<AliasListQuery>,
) -> ApiResult<Vec<Alias>> {
    let aliases = repo.list(user.user_id, query.domain_id).await?;

    debug!(
        user_id = user.user_id.to_string(),
        "listed {} aliases",
        aliases.len()
    );

    Ok(ApiResponse(aliases))
}

pub async fn create_alias(
    State(state): State<ApiState>,
    user: AuthUser,
    Json(request): Json<NewAliasRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate()?;

    let repo = AliasRepository::new(state.pool.clone());
    let alias = repo
        .create(
            user.user_id,
            request.domain_id,
            &request.local_part,
            request.description,
        )
        .await
        .map_err(|e| match e {
            crate::models::Error::Conflict => ApiError::Conflict("alias"),
            crate::models::Error::NotFound(_) => {
                ApiError::Validation("domain not found or not verified".to_string())
            }
            e => e.into(),
        })?;

    info!(
        user_id = user.user_id.to_string(),
        alias_id = alias.id().to_string(),
        address = alias.full_address(),
        "created alias"
    );

    if let Err(e) = state.bus.publish(
        &tenant_for(user.user_id),
        EventPayload::AliasCreated {
            alias_id: alias.id(),
            full_address: alias.full_address().to_string(),
        },
    ) {
        debug!("could not publish alias_created: {e}");
    }

    Ok((StatusCode::CREATED, ApiResponse(alias)))
}

pub async fn update_alias(
    State(repo): State<AliasRepository>,
    user: AuthUser,
    Path(alias_id): Path<AliasId>,
    Json(update): Json<AliasUpdate>,
) -> ApiResult<Alias> {
    let alias = repo.update(user.user_id, alias_id, update).await?;

    info!(
        user_id = user.user_id.to_string(),
        alias_id = alias.id().to_string(),
        "updated alias"
    );

    Ok(ApiResponse(alias))
}

#[derive(Serialize)]
pub struct AliasDeleted {
    alias_id: AliasId,
    #[serde(flatten)]
    cascade: AliasCascade,
}

pub async fn remove_alias(
    State(state): State<ApiState>,
    user: AuthUser,
    Path(alias_id): Path<AliasId>,
) -> ApiResult<AliasDeleted> {
    let repo = AliasRepository::new(state.pool.clone());
    let cascade = repo.remove(user.user_id, alias_id).await?;

    info!(
        user_id = user.user_id.to_string(),
        alias_id = alias_id.to_string(),
        emails = cascade.emails,
        "deleted alias"
    );

    if let Err(e) = state.bus.publish(
        &tenant_for(user.user_id),
        EventPayload::AliasDeleted { alias_id },
    ) {
        debug!("could not publish alias_deleted: {e}");
    }

    Ok(ApiResponse(AliasDeleted { alias_id, cascade }))
}
