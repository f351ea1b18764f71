use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{
    CertificateRecord, CertificateRepository, CertificateStatus, DomainId, DomainRepository,
};

pub mod acme;
pub mod sni;
mod store;

pub use acme::{AcmeOrderer, ApiDnsProvider, DnsChallengeProvider};
pub use sni::SniResolver;
pub use store::{CertBundle, CertMeta, EncryptedCertStore, parse_encryption_key};

#[derive(Clone)]
pub struct CertConfig {
    pub acme_contact: Option<String>,
    pub acme_staging: bool,
    pub dns_api_endpoint: Option<String>,
    pub dns_api_token: Option<String>,
    pub storage_path: PathBuf,
    pub encryption_key: [u8; 32],
    pub renewal_window: ChronoDuration,
    pub check_interval: Duration,
    pub provision_timeout: Duration,
    pub max_concurrent: usize,
    pub default_cert_file: Option<PathBuf>,
    pub default_key_file: Option<PathBuf>,
}

impl CertConfig {
    pub fn from_env() -> Self {
        let encryption_key = parse_encryption_key(
            &std::env::var("CERT_ENCRYPTION_KEY")
                .expect("Missing CERT_ENCRYPTION_KEY environment variable"),
        )
        .expect("CERT_ENCRYPTION_KEY must be 32 bytes of hex");

        Self {
            acme_contact: std::env::var("ACME_CONTACT_EMAIL").ok(),
            acme_staging: std::env::var("ACME_STAGING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            dns_api_endpoint: std::env::var("DNS_PROVIDER_API_ENDPOINT").ok(),
            dns_api_token: std::env::var("DNS_PROVIDER_API_TOKEN").ok(),
            storage_path: std::env::var("CERT_STORAGE_PATH")
                .unwrap_or_else(|_| "./certs".to_string())
                .into(),
            encryption_key,
            renewal_window: ChronoDuration::days(env_u64("CERT_RENEWAL_WINDOW_DAYS", 30) as i64),
            check_interval: Duration::from_secs(
                env_u64("CERT_CHECK_INTERVAL_HOURS", 24) * 60 * 60,
            ),
            provision_timeout: Duration::from_secs(
                env_u64("CERT_PROVISION_TIMEOUT_SECONDS", 5 * 60),
            ),
            max_concurrent: env_u64("CERT_MAX_CONCURRENT_PROVISIONING", 10) as usize,
            default_cert_file: std::env::var("SMTP_TLS_CERT_FILE").ok().map(Into::into),
            default_key_file: std::env::var("SMTP_TLS_KEY_FILE").ok().map(Into::into),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

struct ProvisionRequest {
    domain_id: DomainId,
    domain_name: String,
}

/// Orchestrates per-domain certificates: queued DNS-01 provisioning with
/// a concurrency cap, the encrypted on-disk cache, the in-memory SNI map,
/// and the daily renewal sweep.
pub struct CertificateManager {
    repository: CertificateRepository,
    domains: DomainRepository,
    store: EncryptedCertStore,
    sni: Arc<SniResolver>,
    orderer: Option<Arc<AcmeOrderer>>,
    workers: Arc<Semaphore>,
    queue_tx: mpsc::Sender<ProvisionRequest>,
    queue_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ProvisionRequest>>>,
    renewal_window: ChronoDuration,
    check_interval: Duration,
    provision_timeout: Duration,
    shutdown: CancellationToken,
}

impl CertificateManager {
    pub async fn new(
        pool: PgPool,
        config: &CertConfig,
        sni: Arc<SniResolver>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let orderer = match (&config.acme_contact, &config.dns_api_endpoint, &config.dns_api_token)
        {
            (Some(contact), Some(endpoint), Some(token)) => {
                let provider = Box::new(ApiDnsProvider::new(endpoint.clone(), token.clone()));
                match AcmeOrderer::connect(contact, config.acme_staging, provider).await {
                    Ok(orderer) => Some(Arc::new(orderer)),
                    Err(e) => {
                        error!("could not connect to the ACME directory: {e}");
                        None
                    }
                }
            }
            _ => {
                warn!("ACME is not configured, per-domain certificates are disabled");
                None
            }
        };

        let (queue_tx, queue_rx) = mpsc::channel(256);

        let manager = Arc::new(Self {
            repository: CertificateRepository::new(pool.clone()),
            domains: DomainRepository::new(pool),
            store: EncryptedCertStore::new(&config.storage_path, &config.encryption_key),
            sni,
            orderer,
            workers: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(Some(queue_rx)),
            renewal_window: config.renewal_window,
            check_interval: config.check_interval,
            provision_timeout: config.provision_timeout,
            shutdown,
        });

        manager.load_default_cert(config);
        manager.warm_sni_cache().await;

        manager
    }

    /// The service's own certificate, used when SNI finds no match.
    fn load_default_cert(&self, config: &CertConfig) {
        let (Some(cert_file), Some(key_file)) = (&config.default_cert_file, &config.default_key_file)
        else {
            return;
        };

        let material = std::fs::read_to_string(cert_file).and_then(|chain| {
            std::fs::read_to_string(key_file).map(|key| (key, chain))
        });

        match material {
            Ok((key_pem, chain_pem)) => match SniResolver::certified_key(&key_pem, &chain_pem) {
                Ok(certified) => {
                    self.sni.set_default(Arc::new(certified));
                    info!("loaded default SMTP TLS certificate");
                }
                Err(e) => error!("default TLS certificate unusable: {e}"),
            },
            Err(e) => error!("could not read default TLS certificate: {e}"),
        }
    }

    /// Rehydrates the SNI map from the encrypted cache at boot.
    async fn warm_sni_cache(&self) {
        let records = match self.repository.list_active().await {
            Ok(records) => records,
            Err(e) => {
                error!("could not list active certificates: {e}");
                return;
            }
        };

        for record in records {
            match self.store.load(record.domain_name()) {
                Ok(Some(bundle)) => {
                    match SniResolver::certified_key(&bundle.key_pem, &bundle.chain_pem) {
                        Ok(certified) => {
                            self.sni.insert(record.domain_name(), Arc::new(certified));
                        }
                        Err(e) => warn!(
                            domain = record.domain_name(),
                            "cached certificate unusable: {e}"
                        ),
                    }
                }
                Ok(None) => warn!(
                    domain = record.domain_name(),
                    "active certificate has no cached material"
                ),
                Err(e) => error!(domain = record.domain_name(), "cert cache read failed: {e}"),
            }
        }

        info!(domains = self.sni.loaded_domains(), "SNI cache warmed");
    }

    /// Queues provisioning for a freshly verified domain. Requests beyond
    /// the queue depth are dropped and retried by the renewal sweep.
    pub fn enqueue(&self, domain_id: DomainId, domain_name: &str) {
        let request = ProvisionRequest {
            domain_id,
            domain_name: domain_name.to_string(),
        };
        if self.queue_tx.try_send(request).is_err() {
            warn!(domain = domain_name, "provisioning queue full, deferring");
        }
    }

    pub async fn healthy(&self) -> bool {
        self.repository
            .count_unhealthy()
            .await
            .map(|count| count == 0)
            .unwrap_or(false)
    }

    pub fn sni(&self) -> Arc<SniResolver> {
        self.sni.clone()
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut queue = self
                .queue_rx
                .lock()
                .await
                .take()
                .expect("certificate manager already running");

            let mut sweep = tokio::time::interval(self.check_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("shutting down certificate manager");
                        return;
                    }
                    _ = sweep.tick() => {
                        self.sweep_renewals().await;
                    }
                    request = queue.recv() => {
                        let Some(request) = request else {
                            return;
                        };

                        let Ok(permit) = self.workers.clone().acquire_owned().await else {
                            error!("certificate worker semaphore closed");
                            return;
                        };
                        let manager = self.clone();
                        tokio::spawn(async move {
                            let _p = permit;
                            if let Err(e) = manager.provision_one(&request).await {
                                error!(domain = request.domain_name, "provisioning failed: {e}");
                            }
                        });
                    }
                }
            }
        })
    }

    async fn provision_one(&self, request: &ProvisionRequest) -> Result<(), anyhow::Error> {
        let Some(orderer) = self.orderer.clone() else {
            debug!(domain = request.domain_name, "skipping provisioning, ACME disabled");
            return Ok(());
        };

        let record = self
            .repository
            .ensure(request.domain_id, &request.domain_name)
            .await?;
        self.repository
            .set_status(record.id(), CertificateStatus::Provisioning)
            .await?;
        self.repository.mark_renewal_attempt(record.id()).await?;

        let issued = match tokio::time::timeout(
            self.provision_timeout,
            orderer.provision(&request.domain_name),
        )
        .await
        {
            Ok(Ok(issued)) => issued,
            Ok(Err(e)) => {
                self.repository.record_renewal_failure(record.id()).await?;
                return Err(e.into());
            }
            Err(_) => {
                self.repository.record_renewal_failure(record.id()).await?;
                anyhow::bail!("provisioning timed out");
            }
        };

        let bundle = CertBundle {
            key_pem: issued.key_pem,
            chain_pem: issued.chain_pem,
            meta: CertMeta {
                domain: request.domain_name.clone(),
                issuer: issued.issuer.clone(),
                serial: issued.serial.clone(),
                issued_at: issued.issued_at,
                expires_at: issued.expires_at,
            },
        };

        let storage_path = self.store.save(&request.domain_name, &bundle)?;

        let certified = SniResolver::certified_key(&bundle.key_pem, &bundle.chain_pem)?;
        self.sni.insert(&request.domain_name, Arc::new(certified));

        self.repository
            .record_issued(
                record.id(),
                &crate::models::IssuedCertificate {
                    issuer: issued.issuer,
                    serial: issued.serial,
                    issued_at: issued.issued_at,
                    expires_at: issued.expires_at,
                    storage_path: storage_path.display().to_string(),
                },
            )
            .await?;
        self.domains
            .set_ssl(request.domain_id, issued.expires_at)
            .await?;

        info!(domain = request.domain_name, "certificate active");
        Ok(())
    }

    /// Daily sweep: re-provision certificates entering the renewal window
    /// and evict expired or revoked material from the SNI map.
    async fn sweep_renewals(&self) {
        match self.repository.find_expiring(self.renewal_window).await {
            Ok(expiring) => {
                for record in expiring {
                    debug!(domain = record.domain_name(), "certificate due for renewal");
                    self.enqueue(record.domain_id(), record.domain_name());
                }
            }
            Err(e) => error!("renewal sweep query failed: {e}"),
        }

        match self.repository.find_lapsed().await {
            Ok(lapsed) => {
                for record in lapsed {
                    self.evict(&record).await;
                }
            }
            Err(e) => error!("lapsed certificate query failed: {e}"),
        }
    }

    async fn evict(&self, record: &CertificateRecord) {
        warn!(domain = record.domain_name(), "removing lapsed certificate from SNI");
        self.sni.remove(record.domain_name());

        let status = if record.status() == CertificateStatus::Revoked {
            CertificateStatus::Revoked
        } else {
            CertificateStatus::Expired
        };
        if let Err(e) = self.repository.set_status(record.id(), status).await {
            error!("could not mark certificate {status:?}: {e}");
        }
        if let Err(e) = self.domains.clear_ssl(record.domain_id()).await {
            error!("could not clear domain ssl flag: {e}");
        }
    }
}
