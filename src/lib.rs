use derive_more::FromStr;
use serde::Serialize;
use sqlx::PgPool;
use std::{env, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod auth;
pub mod certs;
pub mod dns;
pub mod events;
pub mod housekeeping;
pub mod ingest;
pub mod limits;
pub mod models;
pub mod parser;
pub mod smtp;
pub mod storage;

pub use api::{ApiConfig, ApiServer, ApiState};
pub use smtp::{SmtpConfig, SmtpServer};

#[derive(Debug, Default, Clone, Copy, FromStr, Serialize)]
pub enum Environment {
    Staging,
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        env::var("ENVIRONMENT")
            .map(|s| s.parse())
            .inspect_err(|_| warn!("Did not find ENVIRONMENT env var, defaulting to development"))
            .unwrap_or(Ok(Environment::Development))
            .expect(
                "Invalid ENVIRONMENT env var, must be one of: development, production, or staging",
            )
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=trace,tower_http=debug,axum=trace,info",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Spawns the SMTP listener wired to the ingestion pipeline.
pub fn run_smtp_server(
    pool: PgPool,
    smtp_config: Arc<SmtpConfig>,
    store: storage::ObjectStore,
    bus: Arc<events::EventBus>,
    sni: Arc<certs::SniResolver>,
    shutdown: CancellationToken,
) {
    let resolver = Arc::new(models::AliasRepository::new(pool.clone()));
    let sink = ingest::Ingestor::new(pool, store, bus);

    SmtpServer::new(smtp_config, resolver, sink, sni, shutdown).spawn();
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
