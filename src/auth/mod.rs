use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::UserId;

/// Any malformed, expired, foreign-signed or type-confused token
/// collapses into this single error so callers cannot probe which check
/// failed.
#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub email: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub kind: TokenKind,
}

#[derive(Debug)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub issuer: String,
}

impl AuthConfig {
    pub fn from_env() -> Self {
        Self {
            access_secret: std::env::var("JWT_ACCESS_SECRET")
                .expect("Missing JWT_ACCESS_SECRET environment variable"),
            refresh_secret: std::env::var("JWT_REFRESH_SECRET")
                .expect("Missing JWT_REFRESH_SECRET environment variable"),
            access_ttl: Duration::minutes(env_i64("JWT_ACCESS_TTL_MINUTES", 15)),
            refresh_ttl: Duration::days(env_i64("JWT_REFRESH_TTL_DAYS", 7)),
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "driftmail".to_string()),
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Issues and validates the two HS256-signed credentials: a short-lived
/// access token and a long-lived refresh token, signed with distinct
/// secrets so one can never stand in for the other.
#[derive(Clone)]
pub struct TokenService {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    issuer: String,
}

impl TokenService {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            issuer: config.issuer.clone(),
        }
    }

    pub fn issue(&self, user_id: UserId, email: &str) -> Result<IssuedTokens, TokenError> {
        let now = Utc::now();
        let refresh_expires_at = now + self.refresh_ttl;

        let access_token = self.sign(user_id, email, TokenKind::Access, now, now + self.access_ttl)?;
        let refresh_token =
            self.sign(user_id, email, TokenKind::Refresh, now, refresh_expires_at)?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            access_expires_in: self.access_ttl.num_seconds(),
            refresh_expires_at,
        })
    }

    fn sign(
        &self,
        user_id: UserId,
        email: &str,
        kind: TokenKind,
        iat: DateTime<Utc>,
        exp: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            iss: self.issuer.clone(),
            iat: iat.timestamp(),
            exp: exp.timestamp(),
            kind,
        };

        let key = match kind {
            TokenKind::Access => &self.access_encoding,
            TokenKind::Refresh => &self.refresh_encoding,
        };

        encode(&Header::default(), &claims, key).map_err(|_| TokenError::Invalid)
    }

    pub fn validate_access(&self, token: &str) -> Result<Claims, TokenError> {
        self.validate(token, TokenKind::Access, &self.access_decoding)
    }

    pub fn validate_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        self.validate(token, TokenKind::Refresh, &self.refresh_decoding)
    }

    fn validate(
        &self,
        token: &str,
        kind: TokenKind,
        key: &DecodingKey,
    ) -> Result<Claims, TokenError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<Claims>(token, key, &validation).map_err(|_| TokenError::Invalid)?;

        if data.claims.kind != kind {
            return Err(TokenError::Invalid);
        }

        Ok(data.claims)
    }
}

/// SHA-256 hex digest of a plaintext refresh token; the only form that is
/// ever persisted.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    fn service() -> TokenService {
        TokenService::new(&AuthConfig {
            access_secret: "access-secret-for-tests-0123456789ab".to_string(),
            refresh_secret: "refresh-secret-for-tests-0123456789a".to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
            issuer: "driftmail".to_string(),
        })
    }

    fn user() -> UserId {
        Uuid::new_v4().into()
    }

    #[test]
    fn issue_and_validate_round_trip() {
        let service = service();
        let user_id = user();

        let tokens = service.issue(user_id, "jane@example.com").unwrap();
        let claims = service.validate_access(&tokens.access_token).unwrap();

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "jane@example.com");
        assert_eq!(claims.kind, TokenKind::Access);
    }

    #[test]
    fn access_and_refresh_do_not_cross_validate() {
        let service = service();
        let tokens = service.issue(user(), "jane@example.com").unwrap();

        assert_eq!(
            service.validate_access(&tokens.refresh_token),
            Err(TokenError::Invalid)
        );
        assert_eq!(
            service.validate_refresh(&tokens.access_token),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let service = service();
        let foreign = TokenService::new(&AuthConfig {
            access_secret: "a-completely-different-access-secret".to_string(),
            refresh_secret: "a-completely-different-refresh-secre".to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
            issuer: "driftmail".to_string(),
        });

        let tokens = foreign.issue(user(), "jane@example.com").unwrap();
        assert_eq!(
            service.validate_access(&tokens.access_token),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let config = AuthConfig {
            access_secret: "access-secret-for-tests-0123456789ab".to_string(),
            refresh_secret: "refresh-secret-for-tests-0123456789a".to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
            issuer: "someone-else".to_string(),
        };
        let other = TokenService::new(&config);

        let tokens = other.issue(user(), "jane@example.com").unwrap();
        assert_eq!(
            service().validate_access(&tokens.access_token),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(
            service().validate_access("not-a-token"),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn digest_is_stable_and_hex() {
        let digest = token_digest("some-refresh-token");

        assert_eq!(digest, token_digest("some-refresh-token"));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(digest, token_digest("another-token"));
    }
}
