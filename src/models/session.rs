use crate::models::{Error, UserId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, From, Display, Deref, sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct SessionId(Uuid);

/// A refresh credential. Only the SHA-256 digest of the plaintext refresh
/// token is ever stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    id: SessionId,
    user_id: UserId,
    #[allow(dead_code)]
    token_digest: String,
    expires_at: DateTime<Utc>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

#[derive(Clone)]
pub struct SessionRepository {
    pool: sqlx::PgPool,
}

impl SessionRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        user_id: UserId,
        token_digest: &str,
        expires_at: DateTime<Utc>,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<SessionId, Error> {
        let id: SessionId = sqlx::query_scalar(
            r#"
            INSERT INTO sessions (id, user_id, token_digest, expires_at, created_at, ip, user_agent)
            VALUES (gen_random_uuid(), $1, $2, $3, NOW(), $4, $5)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(token_digest)
        .bind(expires_at)
        .bind(ip)
        .bind(user_agent)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn find_by_digest(&self, token_digest: &str) -> Result<Option<Session>, Error> {
        sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, token_digest, expires_at, created_at
            FROM sessions
            WHERE token_digest = $1
            "#,
        )
        .bind(token_digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Deletes the old digest and inserts the replacement in one
    /// transaction, so a refresh token can never be replayed after
    /// rotation.
    pub async fn rotate(
        &self,
        old_digest: &str,
        new_digest: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionId, Error> {
        let mut tx = self.pool.begin().await?;

        let user_id: UserId =
            sqlx::query_scalar("DELETE FROM sessions WHERE token_digest = $1 RETURNING user_id")
                .bind(old_digest)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(Error::NotFound("session"))?;

        let id: SessionId = sqlx::query_scalar(
            r#"
            INSERT INTO sessions (id, user_id, token_digest, expires_at, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, NOW())
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(new_digest)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(id)
    }

    pub async fn remove_by_digest(&self, token_digest: &str) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_digest = $1")
            .bind(token_digest)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn sweep_expired(&self) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
