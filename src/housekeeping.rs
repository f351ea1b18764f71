use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::models::{self, SessionRepository, UserRepository};

/// Failed-login rows older than this are dropped; the lockout check only
/// ever reads the last 15 minutes.
const FAILED_LOGIN_RETENTION_HOURS: i64 = 24;

/// Background housekeeping: one task that runs every retention sweep on a
/// shared cadence. A sweep that fails is logged and retried on the next
/// tick; it never takes the task down.
pub struct Housekeeping {
    users: UserRepository,
    sessions: SessionRepository,
    cadence: StdDuration,
    shutdown: CancellationToken,
}

impl Housekeeping {
    pub fn new(pool: PgPool, cadence: StdDuration, shutdown: CancellationToken) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            sessions: SessionRepository::new(pool),
            cadence,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.cadence);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("stopping housekeeping sweeps");
                        return;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = self.expire_failed_logins().await {
                            error!("failed-login sweep did not complete: {e}");
                        }
                        if let Err(e) = self.expire_sessions().await {
                            error!("session sweep did not complete: {e}");
                        }
                    }
                }
            }
        })
    }

    /// Drops failed-login rows that have aged out of the retention window.
    async fn expire_failed_logins(&self) -> Result<(), models::Error> {
        let cutoff = Utc::now() - Duration::hours(FAILED_LOGIN_RETENTION_HOURS);
        let dropped = self.users.sweep_failed_attempts(cutoff).await?;
        if dropped > 0 {
            debug!(dropped, "expired old failed-login attempts");
        }
        Ok(())
    }

    /// Drops refresh sessions past their expiry.
    async fn expire_sessions(&self) -> Result<(), models::Error> {
        let dropped = self.sessions.sweep_expired().await?;
        if dropped > 0 {
            debug!(dropped, "expired stale refresh sessions");
        }
        Ok(())
    }
}
