use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    OrderStatus,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("acme protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),
    #[error("dns provider error: {0}")]
    DnsProvider(String),
    #[error("order failed: {0}")]
    Order(String),
    #[error("csr generation failed: {0}")]
    Csr(#[from] rcgen::Error),
    #[error("issued certificate could not be parsed: {0}")]
    Parse(String),
}

/// Seam to the DNS provider hosting the zone: creates and removes the
/// `_acme-challenge` TXT records for DNS-01 validation.
#[async_trait]
pub trait DnsChallengeProvider: Send + Sync {
    async fn upsert_txt(&self, name: &str, value: &str) -> Result<(), AcmeError>;
    async fn remove_txt(&self, name: &str) -> Result<(), AcmeError>;
}

/// Token-authenticated JSON API client for the configured DNS provider.
pub struct ApiDnsProvider {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ApiDnsProvider {
    pub fn new(endpoint: String, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
        }
    }
}

#[async_trait]
impl DnsChallengeProvider for ApiDnsProvider {
    async fn upsert_txt(&self, name: &str, value: &str) -> Result<(), AcmeError> {
        self.client
            .post(format!("{}/records", self.endpoint))
            .bearer_auth(&self.token)
            .json(&json!({ "type": "TXT", "name": name, "content": value, "ttl": 60 }))
            .send()
            .await
            .map_err(|e| AcmeError::DnsProvider(e.to_string()))?
            .error_for_status()
            .map_err(|e| AcmeError::DnsProvider(e.to_string()))?;

        Ok(())
    }

    async fn remove_txt(&self, name: &str) -> Result<(), AcmeError> {
        self.client
            .delete(format!("{}/records", self.endpoint))
            .bearer_auth(&self.token)
            .json(&json!({ "type": "TXT", "name": name }))
            .send()
            .await
            .map_err(|e| AcmeError::DnsProvider(e.to_string()))?
            .error_for_status()
            .map_err(|e| AcmeError::DnsProvider(e.to_string()))?;

        Ok(())
    }
}

/// Material handed back by a completed order.
#[derive(Debug)]
pub struct IssuedMaterial {
    pub key_pem: String,
    pub chain_pem: String,
    pub issuer: String,
    pub serial: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct AcmeOrderer {
    account: Account,
    provider: Box<dyn DnsChallengeProvider>,
}

impl AcmeOrderer {
    /// Creates (or re-attaches to) the service's ACME account.
    pub async fn connect(
        contact_email: &str,
        staging: bool,
        provider: Box<dyn DnsChallengeProvider>,
    ) -> Result<Self, AcmeError> {
        let directory = if staging {
            LetsEncrypt::Staging.url()
        } else {
            LetsEncrypt::Production.url()
        };

        let contact = format!("mailto:{contact_email}");
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &[&contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory,
            None,
        )
        .await?;

        info!(staging, "connected to ACME directory");

        Ok(Self { account, provider })
    }

    /// Runs a full DNS-01 order for one domain. The caller owns the
    /// overall deadline.
    pub async fn provision(&self, domain: &str) -> Result<IssuedMaterial, AcmeError> {
        let identifier = Identifier::Dns(domain.to_string());
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await?;

        let authorizations = order.authorizations().await?;
        let mut challenge_records = Vec::new();

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => return Err(AcmeError::Order(format!("authorization is {status:?}"))),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::Order("no DNS-01 challenge offered".to_string()))?;

            #[allow(unreachable_patterns)]
            let authz_domain = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => return Err(AcmeError::Order("unsupported identifier type".to_string())),
            };
            let record_name = format!("_acme-challenge.{authz_domain}");
            let record_value = order.key_authorization(challenge).dns_value();

            debug!(domain = authz_domain.as_str(), "publishing DNS-01 challenge record");
            self.provider.upsert_txt(&record_name, &record_value).await?;
            challenge_records.push(record_name);

            order.set_challenge_ready(&challenge.url).await?;
        }

        let result = self.finish_order(&mut order, domain).await;

        for record in challenge_records {
            if let Err(e) = self.provider.remove_txt(&record).await {
                warn!(record, "failed to clean up challenge record: {e}");
            }
        }

        result
    }

    async fn finish_order(
        &self,
        order: &mut instant_acme::Order,
        domain: &str,
    ) -> Result<IssuedMaterial, AcmeError> {
        // poll with gentle backoff until the CA has validated the records
        let mut delay = Duration::from_secs(2);
        loop {
            let state = order.refresh().await?;
            trace!(domain, status = ?state.status, "order state");
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(AcmeError::Order("order became invalid".to_string()));
                }
                _ => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }

        let key_pair = rcgen::KeyPair::generate()?;
        let csr = rcgen::CertificateParams::new(vec![domain.to_string()])?
            .serialize_request(&key_pair)?;

        order.finalize(csr.der().as_ref()).await?;

        let chain_pem = loop {
            match order.certificate().await? {
                Some(chain) => break chain,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        let meta = inspect_leaf(&chain_pem)?;
        info!(domain, expires_at = %meta.expires_at, "certificate issued");

        Ok(IssuedMaterial {
            key_pem: key_pair.serialize_pem(),
            chain_pem,
            issuer: meta.issuer,
            serial: meta.serial,
            issued_at: meta.issued_at,
            expires_at: meta.expires_at,
        })
    }
}

pub struct LeafInfo {
    pub issuer: String,
    pub serial: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Pulls issuer/serial/validity from the first certificate in a PEM chain.
pub fn inspect_leaf(chain_pem: &str) -> Result<LeafInfo, AcmeError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| AcmeError::Parse(format!("{e:?}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| AcmeError::Parse(format!("{e:?}")))?;

    let validity = cert.validity();
    let issued_at = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| AcmeError::Parse("notBefore out of range".to_string()))?;
    let expires_at = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| AcmeError::Parse("notAfter out of range".to_string()))?;

    Ok(LeafInfo {
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        issued_at,
        expires_at,
    })
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    /// Records TXT upserts in memory; the test inspects what would have
    /// been published.
    #[derive(Default)]
    pub struct StaticDnsProvider {
        pub records: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl DnsChallengeProvider for StaticDnsProvider {
        async fn upsert_txt(&self, name: &str, value: &str) -> Result<(), AcmeError> {
            self.records
                .lock()
                .unwrap()
                .insert(name.to_string(), value.to_string());
            Ok(())
        }

        async fn remove_txt(&self, name: &str) -> Result<(), AcmeError> {
            self.records.lock().unwrap().remove(name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inspect_leaf_reads_validity() {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["foo.test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();

        let info = inspect_leaf(&cert.pem()).unwrap();
        assert!(info.expires_at > info.issued_at);
        assert!(!info.serial.is_empty());
    }

    #[test]
    fn inspect_leaf_rejects_garbage() {
        assert!(inspect_leaf("definitely not pem").is_err());
    }

    #[tokio::test]
    async fn mock_provider_tracks_records() {
        let provider = mock::StaticDnsProvider::default();

        provider
            .upsert_txt("_acme-challenge.foo.test", "value")
            .await
            .unwrap();
        assert_eq!(provider.records.lock().unwrap().len(), 1);

        provider.remove_txt("_acme-challenge.foo.test").await.unwrap();
        assert!(provider.records.lock().unwrap().is_empty());
    }
}
