use axum::{
    extract::{ConnectInfo, FromRef, FromRequestParts, State},
    http::request::Parts,
};
use chrono::Duration;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

use crate::{
    api::{
        ApiState,
        error::{ApiError, ApiResponse, ApiResult},
    },
    auth::{TokenService, token_digest},
    models::{SessionRepository, UserId, UserRepository},
};

/// Brute-force window: this many failures from one email or IP inside the
/// window locks the login endpoint out.
const LOGIN_MAX_FAILURES: i64 = 5;
const LOGIN_WINDOW_MINUTES: i64 = 15;

/// The authenticated caller, injected into handlers from the bearer
/// token. Absence of a bearer is `AUTH_TOKEN_MISSING`; every validation
/// failure collapses to `AUTH_TOKEN_INVALID`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: String,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    ApiState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::AuthTokenMissing)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::AuthTokenMissing)?;

        let state: ApiState = FromRef::from_ref(state);
        let claims = state
            .tokens
            .validate_access(token)
            .map_err(|_| ApiError::AuthTokenInvalid)?;

        trace!(user_id = claims.sub.to_string(), "authenticated request");

        Ok(AuthUser {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[garde(email)]
    email: String,
    #[garde(length(min = 8, max = 128))]
    password: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    user_id: UserId,
    email: String,
}

pub async fn register(
    State(users): State<UserRepository>,
    axum::Json(request): axum::Json<RegisterRequest>,
) -> ApiResult<RegisterResponse> {
    request.validate()?;

    let user = users
        .create(&request.email, &request.password)
        .await
        .map_err(|e| match e {
            crate::models::Error::Conflict => {
                ApiError::Validation("email already registered".to_string())
            }
            e => e.into(),
        })?;

    info!(user_id = user.id().to_string(), "registered user");

    Ok(ApiResponse(RegisterResponse {
        user_id: user.id(),
        email: user.email().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: i64,
}

pub async fn login(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: http::HeaderMap,
    axum::Json(request): axum::Json<LoginRequest>,
) -> ApiResult<TokenResponse> {
    let users = UserRepository::new(state.pool.clone());
    let sessions = SessionRepository::new(state.pool.clone());
    let ip = peer.ip();

    let recent_failures = users
        .failed_attempts_in_window(&request.email, ip, Duration::minutes(LOGIN_WINDOW_MINUTES))
        .await?;
    if recent_failures >= LOGIN_MAX_FAILURES {
        warn!(email = request.email, %ip, "login locked out");
        return Err(ApiError::RateLimited);
    }

    let user = match users.find_by_email(&request.email).await? {
        Some(user) if user.is_active() && user.verify_password(&request.password) => user,
        _ => {
            users.record_failed_attempt(&request.email, ip).await?;
            debug!(email = request.email, %ip, "failed login attempt");
            return Err(ApiError::AccessDenied);
        }
    };

    let issued = state
        .tokens
        .issue(user.id(), user.email())
        .map_err(|_| ApiError::Internal)?;

    let user_agent = headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    sessions
        .create(
            user.id(),
            &token_digest(&issued.refresh_token),
            issued.refresh_expires_at,
            Some(ip.to_string()),
            user_agent,
        )
        .await?;
    users.record_login(user.id()).await?;

    info!(user_id = user.id().to_string(), "user logged in");

    Ok(ApiResponse(TokenResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        token_type: "Bearer",
        expires_in: issued.access_expires_in,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    refresh_token: String,
}

/// Rotates a refresh credential: the old digest is deleted atomically
/// with the new one's insertion, so the old token cannot be replayed.
pub async fn refresh(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<RefreshRequest>,
) -> ApiResult<TokenResponse> {
    let sessions = SessionRepository::new(state.pool.clone());

    let claims = state
        .tokens
        .validate_refresh(&request.refresh_token)
        .map_err(|_| ApiError::AuthTokenInvalid)?;

    let old_digest = token_digest(&request.refresh_token);
    let session = sessions
        .find_by_digest(&old_digest)
        .await?
        .ok_or(ApiError::AuthTokenInvalid)?;
    if session.is_expired() || session.user_id() != claims.sub {
        return Err(ApiError::AuthTokenInvalid);
    }

    let issued = state
        .tokens
        .issue(claims.sub, &claims.email)
        .map_err(|_| ApiError::Internal)?;

    sessions
        .rotate(
            &old_digest,
            &token_digest(&issued.refresh_token),
            issued.refresh_expires_at,
        )
        .await
        .map_err(|e| match e {
            crate::models::Error::NotFound(_) => ApiError::AuthTokenInvalid,
            e => e.into(),
        })?;

    debug!(user_id = claims.sub.to_string(), "rotated refresh token");

    Ok(ApiResponse(TokenResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        token_type: "Bearer",
        expires_in: issued.access_expires_in,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    refresh_token: String,
}

#[derive(Serialize)]
pub struct LogoutResponse {
    logged_out: bool,
}

pub async fn logout(
    State(state): State<ApiState>,
    user: AuthUser,
    axum::Json(request): axum::Json<LogoutRequest>,
) -> ApiResult<LogoutResponse> {
    let sessions = SessionRepository::new(state.pool.clone());
    let removed = sessions
        .remove_by_digest(&token_digest(&request.refresh_token))
        .await?;

    info!(user_id = user.user_id.to_string(), "user logged out");

    Ok(ApiResponse(LogoutResponse { logged_out: removed }))
}

/// Deletes the account and, through the foreign keys, everything it
/// owns: domains, aliases, messages, attachments and sessions.
pub async fn delete_account(
    State(users): State<UserRepository>,
    user: AuthUser,
) -> ApiResult<crate::models::UserCascade> {
    let cascade = users.remove(user.user_id).await?;

    info!(
        user_id = user.user_id.to_string(),
        domains = cascade.domains,
        aliases = cascade.aliases,
        emails = cascade.emails,
        "deleted account"
    );

    Ok(ApiResponse(cascade))
}

/// Re-exported for the router: lets `State(TokenService)` extraction work.
impl FromRef<ApiState> for TokenService {
    fn from_ref(state: &ApiState) -> Self {
        state.tokens.clone()
    }
}
