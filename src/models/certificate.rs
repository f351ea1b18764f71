use crate::models::{DomainId, Error};
use chrono::{DateTime, Duration, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, From, Display, Deref, sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct CertificateId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "certificate_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Pending,
    Provisioning,
    Active,
    Expired,
    Revoked,
    Failed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CertificateRecord {
    id: CertificateId,
    domain_id: DomainId,
    domain_name: String,
    status: CertificateStatus,
    issuer: Option<String>,
    serial: Option<String>,
    issued_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    last_renewal_attempt: Option<DateTime<Utc>>,
    renewal_failures: i32,
    storage_path: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CertificateRecord {
    pub fn id(&self) -> CertificateId {
        self.id
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    pub fn status(&self) -> CertificateStatus {
        self.status
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn renewal_failures(&self) -> i32 {
        self.renewal_failures
    }
}

/// Metadata recorded when an ACME order completes.
#[derive(Debug)]
pub struct IssuedCertificate {
    pub issuer: String,
    pub serial: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub storage_path: String,
}

#[derive(Clone)]
pub struct CertificateRepository {
    pool: sqlx::PgPool,
}

impl CertificateRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// One record per domain; re-provisioning reuses the row.
    pub async fn ensure(&self, domain: DomainId, name: &str) -> Result<CertificateRecord, Error> {
        sqlx::query_as::<_, CertificateRecord>(
            r#"
            INSERT INTO ssl_certificates
                (id, domain_id, domain_name, status, renewal_failures, created_at, updated_at)
            VALUES (gen_random_uuid(), $1, LOWER($2), 'pending', 0, NOW(), NOW())
            ON CONFLICT (domain_id) DO UPDATE SET updated_at = NOW()
            RETURNING id, domain_id, domain_name, status, issuer, serial, issued_at, expires_at,
                      last_renewal_attempt, renewal_failures, storage_path, created_at, updated_at
            "#,
        )
        .bind(domain)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_status(
        &self,
        id: CertificateId,
        status: CertificateStatus,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE ssl_certificates SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn record_issued(
        &self,
        id: CertificateId,
        issued: &IssuedCertificate,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE ssl_certificates
            SET status = 'active', issuer = $2, serial = $3, issued_at = $4, expires_at = $5,
                storage_path = $6, renewal_failures = 0, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&issued.issuer)
        .bind(&issued.serial)
        .bind(issued.issued_at)
        .bind(issued.expires_at)
        .bind(&issued.storage_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_renewal_failure(&self, id: CertificateId) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE ssl_certificates
            SET status = 'failed', renewal_failures = renewal_failures + 1,
                last_renewal_attempt = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_renewal_attempt(&self, id: CertificateId) -> Result<(), Error> {
        sqlx::query(
            "UPDATE ssl_certificates SET last_renewal_attempt = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_active(&self) -> Result<Vec<CertificateRecord>, Error> {
        sqlx::query_as::<_, CertificateRecord>(
            r#"
            SELECT id, domain_id, domain_name, status, issuer, serial, issued_at, expires_at,
                   last_renewal_attempt, renewal_failures, storage_path, created_at, updated_at
            FROM ssl_certificates
            WHERE status = 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Active certificates entering the renewal window.
    pub async fn find_expiring(&self, window: Duration) -> Result<Vec<CertificateRecord>, Error> {
        sqlx::query_as::<_, CertificateRecord>(
            r#"
            SELECT id, domain_id, domain_name, status, issuer, serial, issued_at, expires_at,
                   last_renewal_attempt, renewal_failures, storage_path, created_at, updated_at
            FROM ssl_certificates
            WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= $1
            "#,
        )
        .bind(Utc::now() + window)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Active certificates already past their expiry (for SNI eviction).
    pub async fn find_lapsed(&self) -> Result<Vec<CertificateRecord>, Error> {
        sqlx::query_as::<_, CertificateRecord>(
            r#"
            SELECT id, domain_id, domain_name, status, issuer, serial, issued_at, expires_at,
                   last_renewal_attempt, renewal_failures, storage_path, created_at, updated_at
            FROM ssl_certificates
            WHERE (status = 'active' AND expires_at IS NOT NULL AND expires_at < NOW())
               OR status = 'revoked'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn count_unhealthy(&self) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ssl_certificates WHERE status = 'failed' OR renewal_failures > 0",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
