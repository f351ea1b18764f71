use crate::models::{Error, UserId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct DomainId(Uuid);

pub const VERIFICATION_TOKEN_PREFIX: &str = "vrf_";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Domain {
    id: DomainId,
    owner_user_id: UserId,
    name: String,
    verification_token: String,
    is_verified: bool,
    verified_at: Option<DateTime<Utc>>,
    ssl_enabled: bool,
    ssl_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Domain {
    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn owner(&self) -> UserId {
        self.owner_user_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn verification_token(&self) -> &str {
        &self.verification_token
    }

    pub fn is_verified(&self) -> bool {
        self.is_verified
    }
}

/// Descendant counts returned alongside a cascade delete.
#[derive(Debug, Serialize)]
pub struct DomainCascade {
    pub aliases: i64,
    pub emails: i64,
    pub attachments: i64,
    pub total_bytes: i64,
}

#[derive(Clone)]
pub struct DomainRepository {
    pool: sqlx::PgPool,
}

impl DomainRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Mints the opaque verification token. Immutable once issued.
    fn mint_verification_token() -> String {
        let suffix = Alphanumeric.sample_string(&mut rand::rng(), 32);
        format!("{VERIFICATION_TOKEN_PREFIX}{}", suffix.to_lowercase())
    }

    pub async fn create(&self, owner: UserId, name: &str) -> Result<Domain, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            INSERT INTO domains
                (id, owner_user_id, name, verification_token, is_verified, ssl_enabled, created_at, updated_at)
            VALUES (gen_random_uuid(), $1, LOWER($2), $3, FALSE, FALSE, NOW(), NOW())
            RETURNING id, owner_user_id, name, verification_token, is_verified, verified_at,
                      ssl_enabled, ssl_expires_at, created_at, updated_at
            "#,
        )
        .bind(owner)
        .bind(name)
        .bind(Self::mint_verification_token())
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn count_for_user(&self, owner: UserId) -> Result<i64, Error> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM domains WHERE owner_user_id = $1")
                .bind(owner)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    pub async fn list(&self, owner: UserId) -> Result<Vec<Domain>, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            SELECT id, owner_user_id, name, verification_token, is_verified, verified_at,
                   ssl_enabled, ssl_expires_at, created_at, updated_at
            FROM domains
            WHERE owner_user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn get(&self, owner: UserId, id: DomainId) -> Result<Domain, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            SELECT id, owner_user_id, name, verification_token, is_verified, verified_at,
                   ssl_enabled, ssl_expires_at, created_at, updated_at
            FROM domains
            WHERE id = $1 AND owner_user_id = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("domain"))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Domain>, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            SELECT id, owner_user_id, name, verification_token, is_verified, verified_at,
                   ssl_enabled, ssl_expires_at, created_at, updated_at
            FROM domains
            WHERE name = LOWER($1)
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn mark_verified(&self, id: DomainId) -> Result<Domain, Error> {
        sqlx::query_as::<_, Domain>(
            r#"
            UPDATE domains
            SET is_verified = TRUE, verified_at = NOW(), updated_at = NOW()
            WHERE id = $1
            RETURNING id, owner_user_id, name, verification_token, is_verified, verified_at,
                      ssl_enabled, ssl_expires_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("domain"))
    }

    pub async fn set_ssl(&self, id: DomainId, expires_at: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE domains
            SET ssl_enabled = TRUE, ssl_expires_at = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear_ssl(&self, id: DomainId) -> Result<(), Error> {
        sqlx::query(
            "UPDATE domains SET ssl_enabled = FALSE, ssl_expires_at = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Cascade delete. Counts descendants first so the caller can report
    /// what went away, then lets the foreign keys do the removal.
    pub async fn remove(&self, owner: UserId, id: DomainId) -> Result<DomainCascade, Error> {
        let mut tx = self.pool.begin().await?;

        let counts = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM aliases WHERE domain_id = $1),
                (SELECT COUNT(*) FROM emails e JOIN aliases a ON e.alias_id = a.id WHERE a.domain_id = $1),
                (SELECT COUNT(*) FROM attachments t
                    JOIN emails e ON t.message_id = e.id
                    JOIN aliases a ON e.alias_id = a.id
                 WHERE a.domain_id = $1),
                COALESCE((SELECT SUM(e.size_bytes) FROM emails e
                    JOIN aliases a ON e.alias_id = a.id
                 WHERE a.domain_id = $1), 0)
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM domains WHERE id = $1 AND owner_user_id = $2")
            .bind(id)
            .bind(owner)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound("domain"));
        }

        tx.commit().await?;

        Ok(DomainCascade {
            aliases: counts.0,
            emails: counts.1,
            attachments: counts.2,
            total_bytes: counts.3,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verification_token_shape() {
        let token = DomainRepository::mint_verification_token();

        assert!(token.starts_with(VERIFICATION_TOKEN_PREFIX));
        assert_eq!(token.len(), VERIFICATION_TOKEN_PREFIX.len() + 32);
        assert!(
            token[VERIFICATION_TOKEN_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn tokens_are_unique() {
        let a = DomainRepository::mint_verification_token();
        let b = DomainRepository::mint_verification_token();

        assert_ne!(a, b);
    }
}
