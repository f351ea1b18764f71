use std::{net::IpAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpListener, select};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    certs::SniResolver,
    ingest::{MessageSink, RecipientResolver},
    limits::{AdmissionError, ConnectionLimits, RateLimiter},
    smtp::{
        SmtpConfig,
        connection::{self, ConnectionError, ConnectionOutcome},
        session::SmtpSession,
    },
};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to listen on address: {0}")]
    Listen(std::io::Error),
}

pub struct SmtpServer {
    config: Arc<SmtpConfig>,
    resolver: Arc<dyn RecipientResolver>,
    sink: Arc<dyn MessageSink>,
    sni: Arc<SniResolver>,
    limits: ConnectionLimits,
    session_rate: Arc<RateLimiter<IpAddr>>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(
        config: Arc<SmtpConfig>,
        resolver: Arc<dyn RecipientResolver>,
        sink: Arc<dyn MessageSink>,
        sni: Arc<SniResolver>,
        shutdown: CancellationToken,
    ) -> Self {
        let limits = ConnectionLimits::new(config.max_connections, config.max_per_ip);
        let session_rate = Arc::new(RateLimiter::new(
            config.sessions_per_minute,
            Duration::from_secs(60),
        ));

        Self {
            config,
            resolver,
            sink,
            sni,
            limits,
            session_rate,
            shutdown,
        }
    }

    fn tls_acceptor(&self) -> TlsAcceptor {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.sni.clone());

        TlsAcceptor::from(Arc::new(config))
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        info!("smtp server on {}", self.config.listen_addr);

        let acceptor = self.tls_acceptor();

        // age out empty rate-limit keys once per window
        let session_rate = self.session_rate.clone();
        let cleaner_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                select! {
                    _ = cleaner_shutdown.cancelled() => return,
                    _ = interval.tick() => session_rate.sweep(),
                }
            }
        });

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp server");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((mut stream, peer_addr)) => {
                        let ip = peer_addr.ip();
                        trace!(source_ip = ip.to_string(), source_port = peer_addr.port(), "new TCP connection");

                        if !self.session_rate.allow(ip) {
                            debug!(%ip, "session rate exceeded");
                            reject(&mut stream, "4.7.0 Too many sessions, slow down").await;
                            continue;
                        }

                        let permit = match self.limits.try_acquire(ip) {
                            Ok(permit) => permit,
                            Err(AdmissionError::GlobalCap) => {
                                warn!(active = self.limits.active(), "global connection cap reached");
                                reject(&mut stream, "4.3.2 Too many connections, try again later").await;
                                continue;
                            }
                            Err(AdmissionError::PerIpCap) => {
                                debug!(%ip, "per-ip connection cap reached");
                                reject(&mut stream, "4.7.0 Too many connections from your address").await;
                                continue;
                            }
                        };

                        let config = self.config.clone();
                        let resolver = self.resolver.clone();
                        let sink = self.sink.clone();
                        let acceptor = acceptor.clone();
                        let tls_available = self.sni.has_any();

                        tokio::spawn(async move {
                            let _permit = permit;

                            let mut session = SmtpSession::new(
                                peer_addr,
                                config.clone(),
                                resolver,
                                sink,
                                tls_available,
                            );

                            let task = async {
                                match connection::handle(&mut stream, &mut session, &config, true).await? {
                                    ConnectionOutcome::Closed => {
                                        stream.shutdown().await.map_err(ConnectionError::Write)
                                    }
                                    ConnectionOutcome::UpgradeTls => {
                                        let mut tls_stream = acceptor
                                            .accept(stream)
                                            .await
                                            .map_err(ConnectionError::Accept)?;
                                        session.reset_for_tls();

                                        // a second STARTTLS is refused in-session,
                                        // so this pass can only end by closing
                                        connection::handle(&mut tls_stream, &mut session, &config, false).await?;
                                        tls_stream.shutdown().await.map_err(ConnectionError::Write)
                                    }
                                }
                            };

                            if let Err(err) = task.await {
                                match err {
                                    ConnectionError::Dropped => {
                                        trace!("connection dropped by peer");
                                    }
                                    err => error!("failed to handle connection: {err}"),
                                }
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {}", err);
                    }
                },
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {:?}", e);
            }
        });
    }
}

/// Graceful pre-EHLO rejection: the client gets a 421 before the
/// connection is closed.
async fn reject(stream: &mut tokio::net::TcpStream, message: &str) {
    let _ = stream
        .write_all(format!("421 {message}\r\n").as_bytes())
        .await;
    let _ = stream.shutdown().await;
}
