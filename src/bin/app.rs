use anyhow::Context;
use driftmail::{
    ApiConfig, ApiServer, ApiState, SmtpConfig,
    auth::{AuthConfig, TokenService},
    certs::{CertConfig, CertificateManager, SniResolver},
    dns::DomainVerifier,
    events::{DEFAULT_RING_CAPACITY, EventBus},
    housekeeping::Housekeeping,
    run_smtp_server, shutdown_signal,
    storage::{ObjectStore, StoreConfig},
};
use sqlx::{ConnectOptions, postgres::{PgConnectOptions, PgPoolOptions}};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    driftmail::init_tracing();

    let database_url: url::Url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?
        .parse()
        .expect("DATABASE_URL must be a valid URL");

    let db_options = PgConnectOptions::from_url(&database_url)?.application_name("driftmail-app");

    let pool = PgPoolOptions::new()
        .min_connections(5)
        .max_connections(
            std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
        )
        .idle_timeout(Duration::from_secs(10 * 60))
        .acquire_timeout(Duration::from_secs(5))
        .test_before_acquire(true)
        .connect_with(db_options)
        .await
        .context("failed to connect to database")?;

    #[cfg(feature = "apply-db-migrations")]
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to apply database migrations")?;

    let shutdown = CancellationToken::new();

    let smtp_config = Arc::new(SmtpConfig::from_env());
    let auth_config = AuthConfig::from_env();
    let cert_config = CertConfig::from_env();
    let api_config = ApiConfig::from_env();
    let store_config = StoreConfig::from_env();

    let bus = Arc::new(EventBus::new(
        std::env::var("EVENT_BUFFER_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RING_CAPACITY),
    ));
    let store = ObjectStore::new(&store_config).await;
    let tokens = TokenService::new(&auth_config);
    let verifier = DomainVerifier::new(smtp_config.hostname.clone());

    let sni = SniResolver::new();
    let certs =
        CertificateManager::new(pool.clone(), &cert_config, sni.clone(), shutdown.clone()).await;
    certs.clone().spawn();

    run_smtp_server(
        pool.clone(),
        smtp_config,
        store.clone(),
        bus.clone(),
        sni,
        shutdown.clone(),
    );

    let state = ApiState::new(
        pool.clone(),
        tokens,
        bus,
        verifier,
        certs,
        store,
        api_config,
    );
    ApiServer::new(state, shutdown.clone()).spawn();

    // hourly retention sweeps (failed logins, stale sessions)
    Housekeeping::new(pool.clone(), Duration::from_secs(60 * 60), shutdown.clone()).spawn();

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give services the opportunity to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
