use crate::models::Error;
use chrono::{DateTime, Duration, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    id: UserId,
    email: String,
    #[serde(skip)]
    password_digest: String,
    created_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
    is_active: bool,
}

impl User {
    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn verify_password(&self, password: &str) -> bool {
        password_auth::verify_password(password.as_bytes(), &self.password_digest).is_ok()
    }
}

/// Descendant counts reported back when a user account is removed.
#[derive(Debug, Serialize)]
pub struct UserCascade {
    pub domains: i64,
    pub aliases: i64,
    pub emails: i64,
}

#[derive(Clone)]
pub struct UserRepository {
    pool: sqlx::PgPool,
}

impl UserRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, email: &str, password: &str) -> Result<User, Error> {
        let digest = password_auth::generate_hash(password.as_bytes());

        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, password_digest, created_at, is_active)
            VALUES (gen_random_uuid(), LOWER($1), $2, NOW(), TRUE)
            RETURNING id, email, password_digest, created_at, last_login_at, is_active
            "#,
        )
        .bind(email)
        .bind(digest)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_digest, created_at, last_login_at, is_active
            FROM users
            WHERE email = LOWER($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(&self, id: UserId) -> Result<Option<User>, Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_digest, created_at, last_login_at, is_active
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn record_login(&self, id: UserId) -> Result<(), Error> {
        sqlx::query("UPDATE users SET last_login_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn record_failed_attempt(&self, email: &str, ip: IpAddr) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO failed_login_attempts (email, ip, attempted_at)
            VALUES (LOWER($1), $2, NOW())
            "#,
        )
        .bind(email)
        .bind(ip.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Failed attempts for either the email or the source IP inside the
    /// brute-force window.
    pub async fn failed_attempts_in_window(
        &self,
        email: &str,
        ip: IpAddr,
        window: Duration,
    ) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM failed_login_attempts
            WHERE (email = LOWER($1) OR ip = $2)
              AND attempted_at > NOW() - $3::interval
            "#,
        )
        .bind(email)
        .bind(ip.to_string())
        .bind(format!("{} seconds", window.num_seconds()))
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn sweep_failed_attempts(&self, before: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM failed_login_attempts WHERE attempted_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn remove(&self, id: UserId) -> Result<UserCascade, Error> {
        let mut tx = self.pool.begin().await?;

        let cascade = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM domains WHERE owner_user_id = $1),
                (SELECT COUNT(*) FROM aliases WHERE user_id = $1),
                (SELECT COUNT(*) FROM emails e JOIN aliases a ON e.alias_id = a.id WHERE a.user_id = $1)
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(UserCascade {
            domains: cascade.0,
            aliases: cascade.1,
            emails: cascade.2,
        })
    }
}
