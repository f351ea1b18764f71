use crate::models::{DomainId, Error, UserId};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct AliasId(Uuid);

pub const MAX_LOCAL_PART_LEN: usize = 64;

/// Checks the local-part rules: 1-64 chars of `[a-z0-9._%+-]`, no
/// leading/trailing/consecutive dots.
pub fn valid_local_part(local: &str) -> bool {
    if local.is_empty() || local.len() > MAX_LOCAL_PART_LEN {
        return false;
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    local
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || ".%_+-".contains(c))
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Alias {
    id: AliasId,
    user_id: UserId,
    domain_id: DomainId,
    local_part: String,
    full_address: String,
    description: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Alias {
    pub fn id(&self) -> AliasId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn full_address(&self) -> &str {
        &self.full_address
    }
}

/// The RCPT-time view of an alias: everything the SMTP listener needs to
/// accept or reject a recipient in one lookup.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResolvedAlias {
    pub alias_id: AliasId,
    pub user_id: UserId,
    pub domain_id: DomainId,
    pub full_address: String,
    pub is_active: bool,
    pub domain_verified: bool,
}

impl ResolvedAlias {
    pub fn accepts_mail(&self) -> bool {
        self.is_active && self.domain_verified
    }
}

#[derive(Debug, Serialize)]
pub struct AliasCascade {
    pub emails: i64,
    pub attachments: i64,
}

#[derive(Debug, Deserialize)]
pub struct AliasUpdate {
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Clone)]
pub struct AliasRepository {
    pool: sqlx::PgPool,
}

impl AliasRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Creates an alias under a verified domain owned by the same user.
    /// The full address is stored lowercased and is globally unique.
    pub async fn create(
        &self,
        user: UserId,
        domain: DomainId,
        local_part: &str,
        description: Option<String>,
    ) -> Result<Alias, Error> {
        let local_part = local_part.to_lowercase();
        if !valid_local_part(&local_part) {
            return Err(Error::BadRequest("invalid alias local part".to_string()));
        }

        sqlx::query_as::<_, Alias>(
            r#"
            INSERT INTO aliases
                (id, user_id, domain_id, local_part, full_address, description, is_active, created_at, updated_at)
            SELECT gen_random_uuid(), $1, d.id, $3, $3 || '@' || d.name, $4, TRUE, NOW(), NOW()
            FROM domains d
            WHERE d.id = $2 AND d.owner_user_id = $1 AND d.is_verified
            RETURNING id, user_id, domain_id, local_part, full_address, description, is_active,
                      created_at, updated_at
            "#,
        )
        .bind(user)
        .bind(domain)
        .bind(&local_part)
        .bind(description)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("verified domain"))
    }

    pub async fn list(&self, user: UserId, domain: Option<DomainId>) -> Result<Vec<Alias>, Error> {
        sqlx::query_as::<_, Alias>(
            r#"
            SELECT id, user_id, domain_id, local_part, full_address, description, is_active,
                   created_at, updated_at
            FROM aliases
            WHERE user_id = $1 AND ($2::uuid IS NULL OR domain_id = $2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(user)
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn get(&self, user: UserId, id: AliasId) -> Result<Alias, Error> {
        sqlx::query_as::<_, Alias>(
            r#"
            SELECT id, user_id, domain_id, local_part, full_address, description, is_active,
                   created_at, updated_at
            FROM aliases
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("alias"))
    }

    pub async fn update(
        &self,
        user: UserId,
        id: AliasId,
        update: AliasUpdate,
    ) -> Result<Alias, Error> {
        sqlx::query_as::<_, Alias>(
            r#"
            UPDATE aliases
            SET description = COALESCE($3, description),
                is_active = COALESCE($4, is_active),
                updated_at = NOW()
            WHERE id = $1 AND user_id = $2
            RETURNING id, user_id, domain_id, local_part, full_address, description, is_active,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(user)
        .bind(update.description)
        .bind(update.is_active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::NotFound("alias"))
    }

    /// The SMTP hot path: one lookup by lowercased address returning the
    /// alias together with its domain's verification state.
    pub async fn resolve(&self, full_address: &str) -> Result<Option<ResolvedAlias>, Error> {
        sqlx::query_as::<_, ResolvedAlias>(
            r#"
            SELECT a.id AS alias_id, a.user_id, a.domain_id, a.full_address, a.is_active,
                   d.is_verified AS domain_verified
            FROM aliases a
            JOIN domains d ON a.domain_id = d.id
            WHERE a.full_address = LOWER($1)
            "#,
        )
        .bind(full_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn remove(&self, user: UserId, id: AliasId) -> Result<AliasCascade, Error> {
        let mut tx = self.pool.begin().await?;

        let counts = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM emails WHERE alias_id = $1),
                (SELECT COUNT(*) FROM attachments t JOIN emails e ON t.message_id = e.id
                 WHERE e.alias_id = $1)
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM aliases WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound("alias"));
        }

        tx.commit().await?;

        Ok(AliasCascade {
            emails: counts.0,
            attachments: counts.1,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_part_rules() {
        assert!(valid_local_part("jane"));
        assert!(valid_local_part("jane.doe+tag"));
        assert!(valid_local_part("a"));
        assert!(valid_local_part("user_99%x-y"));

        assert!(!valid_local_part(""));
        assert!(!valid_local_part(".jane"));
        assert!(!valid_local_part("jane."));
        assert!(!valid_local_part("ja..ne"));
        assert!(!valid_local_part("Jane"));
        assert!(!valid_local_part("jane doe"));
        assert!(!valid_local_part(&"a".repeat(65)));
    }
}
