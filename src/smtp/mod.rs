use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

mod connection;
pub mod server;
mod session;

pub use server::SmtpServer;

#[derive(Clone)]
pub struct SmtpConfig {
    pub listen_addr: SocketAddr,
    /// Advertised in the greeting banner and the EHLO response; also the
    /// hostname domain owners point their MX records at.
    pub hostname: String,
    pub max_connections: usize,
    pub max_per_ip: usize,
    pub sessions_per_minute: usize,
    pub idle_timeout: Duration,
    pub max_message_size: u64,
    pub max_recipients: usize,
}

impl SmtpConfig {
    pub fn from_env() -> Self {
        let port = env_u64("SMTP_PORT", 25) as u16;

        Self {
            listen_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into(),
            hostname: std::env::var("SMTP_HOSTNAME")
                .expect("Missing SMTP_HOSTNAME environment variable"),
            max_connections: env_u64("SMTP_MAX_CONNECTIONS", 100) as usize,
            max_per_ip: env_u64("SMTP_MAX_CONNECTIONS_PER_IP", 5) as usize,
            sessions_per_minute: env_u64("SMTP_SESSIONS_PER_MINUTE", 20) as usize,
            idle_timeout: Duration::from_secs(env_u64("SMTP_IDLE_TIMEOUT_SECONDS", 5 * 60)),
            max_message_size: env_u64("SMTP_MAX_MESSAGE_SIZE", 25 * 1024 * 1024),
            max_recipients: env_u64("SMTP_MAX_RECIPIENTS", 100) as usize,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod test {
    use super::{
        SmtpConfig,
        connection::{self, ConnectionOutcome},
        session::SmtpSession,
    };
    use crate::{
        ingest::{DataResult, IngestError, IngestReceipt, MessageSink, RecipientResolver},
        models::{self, ResolvedAlias},
    };
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    };
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
        task::JoinHandle,
    };
    use tracing_test::traced_test;
    use uuid::Uuid;

    fn test_config(max_message_size: u64, max_recipients: usize) -> Arc<SmtpConfig> {
        Arc::new(SmtpConfig {
            listen_addr: "127.0.0.1:2525".parse().unwrap(),
            hostname: "mx.driftmail.io".to_string(),
            max_connections: 100,
            max_per_ip: 5,
            sessions_per_minute: 20,
            idle_timeout: Duration::from_secs(5),
            max_message_size,
            max_recipients,
        })
    }

    struct StaticDirectory {
        aliases: HashMap<String, ResolvedAlias>,
    }

    impl StaticDirectory {
        fn with(addresses: &[(&str, bool, bool)]) -> Arc<Self> {
            let aliases = addresses
                .iter()
                .map(|&(address, is_active, domain_verified)| {
                    (
                        address.to_string(),
                        ResolvedAlias {
                            alias_id: Uuid::new_v4().into(),
                            user_id: Uuid::new_v4().into(),
                            domain_id: Uuid::new_v4().into(),
                            full_address: address.to_string(),
                            is_active,
                            domain_verified,
                        },
                    )
                })
                .collect();
            Arc::new(Self { aliases })
        }
    }

    #[async_trait]
    impl RecipientResolver for StaticDirectory {
        async fn resolve_recipient(
            &self,
            address: &str,
        ) -> Result<Option<ResolvedAlias>, models::Error> {
            Ok(self.aliases.get(&address.to_lowercase()).cloned())
        }
    }

    enum SinkMode {
        Accept,
        Transient,
    }

    struct CollectingSink {
        received: Mutex<Vec<DataResult>>,
        mode: SinkMode,
    }

    impl CollectingSink {
        fn new(mode: SinkMode) -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                mode,
            })
        }

        fn messages(&self) -> usize {
            self.received.lock().unwrap().len()
        }

        fn last_raw(&self) -> Vec<u8> {
            self.received.lock().unwrap().last().unwrap().raw.clone()
        }
    }

    #[async_trait]
    impl MessageSink for CollectingSink {
        async fn ingest(&self, data: DataResult) -> Result<IngestReceipt, IngestError> {
            match self.mode {
                SinkMode::Accept => {
                    let queue_id = data.queue_id;
                    let accepted = data.recipients.len();
                    self.received.lock().unwrap().push(data);
                    Ok(IngestReceipt {
                        queue_id,
                        accepted,
                    })
                }
                SinkMode::Transient => Err(IngestError::Transient("database is down".into())),
            }
        }
    }

    struct TestClient {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl TestClient {
        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        /// Reads one (possibly multi-line) reply, returning the code and
        /// the final line.
        async fn reply(&mut self) -> (u16, String) {
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                assert!(!line.is_empty(), "connection closed while awaiting reply");

                let code: u16 = line[..3].parse().expect("reply must start with a code");
                if line.as_bytes().get(3) == Some(&b' ') || line.len() <= 5 {
                    return (code, line.trim_end().to_string());
                }
                // "250-..." continuation lines of an EHLO reply
            }
        }

        async fn expect(&mut self, code: u16) -> String {
            let (got, line) = self.reply().await;
            assert_eq!(got, code, "unexpected reply: {line}");
            line
        }
    }

    fn start(
        directory: Arc<StaticDirectory>,
        sink: Arc<CollectingSink>,
        config: Arc<SmtpConfig>,
    ) -> (TestClient, JoinHandle<ConnectionOutcome>) {
        let (client, mut server) = tokio::io::duplex(256 * 1024);

        let server_config = config.clone();
        let handle = tokio::spawn(async move {
            let mut session = SmtpSession::new(
                "127.0.0.1:9999".parse().unwrap(),
                server_config.clone(),
                directory,
                sink,
                false,
            );
            connection::handle(&mut server, &mut session, &server_config, true)
                .await
                .unwrap()
        });

        let (read, write) = tokio::io::split(client);
        (
            TestClient {
                reader: BufReader::new(read),
                writer: write,
            },
            handle,
        )
    }

    fn verified_inbox() -> Arc<StaticDirectory> {
        StaticDirectory::with(&[("u@verified.example", true, true)])
    }

    #[tokio::test]
    #[traced_test]
    async fn ingest_plain_mail() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, handle) = start(verified_inbox(), sink.clone(), test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
        client.send("RCPT TO:<u@verified.example>").await;
        client.expect(250).await;
        client.send("DATA").await;
        client.expect(354).await;
        client
            .send("From: Jane <a@ext.com>\r\nTo: u@verified.example\r\nSubject: Hi\r\n\r\nHello\r\n.")
            .await;
        let ok = client.expect(250).await;
        assert!(ok.contains("2.0.0 OK"));

        client.send("QUIT").await;
        client.expect(221).await;
        assert!(matches!(handle.await.unwrap(), ConnectionOutcome::Closed));

        assert_eq!(sink.messages(), 1);
        assert_eq!(
            sink.last_raw(),
            b"From: Jane <a@ext.com>\r\nTo: u@verified.example\r\nSubject: Hi\r\n\r\nHello"
        );
    }

    #[tokio::test]
    async fn ehlo_advertises_capabilities() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) =
            start(verified_inbox(), sink, test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client
            .writer
            .write_all(b"EHLO client.example\r\n")
            .await
            .unwrap();

        let mut saw_size = false;
        let mut saw_8bitmime = false;
        let mut saw_pipelining = false;
        let mut saw_starttls = false;
        loop {
            let mut line = String::new();
            client.reader.read_line(&mut line).await.unwrap();
            let upper = line.to_uppercase();
            saw_size |= upper.contains("SIZE");
            saw_8bitmime |= upper.contains("8BITMIME");
            saw_pipelining |= upper.contains("PIPELINING");
            saw_starttls |= upper.contains("STARTTLS");
            if line.as_bytes().get(3) == Some(&b' ') {
                break;
            }
        }

        assert!(saw_size && saw_8bitmime && saw_pipelining);
        // no certificate loaded in this session
        assert!(!saw_starttls);
    }

    #[tokio::test]
    async fn unknown_recipient_is_rejected() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) =
            start(verified_inbox(), sink.clone(), test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
        client.send("RCPT TO:<missing@verified.example>").await;
        let reply = client.expect(550).await;
        assert!(reply.contains("5.1.1"));

        // no surviving recipient: DATA is refused
        client.send("DATA").await;
        client.expect(554).await;
        assert_eq!(sink.messages(), 0);
    }

    #[tokio::test]
    async fn inactive_and_unverified_recipients_are_rejected() {
        let directory = StaticDirectory::with(&[
            ("paused@verified.example", false, true),
            ("u@pending.example", true, false),
        ]);
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) = start(directory, sink, test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;

        client.send("RCPT TO:<paused@verified.example>").await;
        client.expect(550).await;
        client.send("RCPT TO:<u@pending.example>").await;
        client.expect(550).await;
    }

    #[tokio::test]
    async fn oversized_message_resets_session_not_connection() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) =
            start(verified_inbox(), sink.clone(), test_config(64, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
        client.send("RCPT TO:<u@verified.example>").await;
        client.expect(250).await;
        client.send("DATA").await;
        client.expect(354).await;

        let big_body = "x".repeat(300);
        client.send(&format!("Subject: big\r\n\r\n{big_body}\r\n.")).await;
        let reply = client.expect(552).await;
        assert!(reply.contains("5.3.4"));
        assert_eq!(sink.messages(), 0);

        // the connection survives: RSET + a fresh envelope work
        client.send("RSET").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
    }

    #[tokio::test]
    async fn dot_stuffing_is_unstuffed() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) =
            start(verified_inbox(), sink.clone(), test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
        client.send("RCPT TO:<u@verified.example>").await;
        client.expect(250).await;
        client.send("DATA").await;
        client.expect(354).await;
        client.send("Subject: dots\r\n\r\n..leading dot\r\n.").await;
        client.expect(250).await;

        let raw = sink.last_raw();
        assert!(raw.ends_with(b"\r\n.leading dot"), "got: {:?}", String::from_utf8_lossy(&raw));
    }

    #[tokio::test]
    async fn commands_out_of_sequence_get_503() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) =
            start(verified_inbox(), sink, test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;

        // before EHLO
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(503).await;

        client.send("EHLO client.example").await;
        client.expect(250).await;

        // RCPT without MAIL
        client.send("RCPT TO:<u@verified.example>").await;
        client.expect(503).await;

        // DATA without envelope
        client.send("DATA").await;
        client.expect(503).await;

        // nested MAIL
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
        client.send("MAIL FROM:<b@ext.com>").await;
        client.expect(503).await;
    }

    #[tokio::test]
    async fn recipient_cap_yields_452() {
        let directory = StaticDirectory::with(&[
            ("u@verified.example", true, true),
            ("v@verified.example", true, true),
        ]);
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) = start(directory, sink, test_config(25 * 1024 * 1024, 1));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
        client.send("RCPT TO:<u@verified.example>").await;
        client.expect(250).await;
        client.send("RCPT TO:<v@verified.example>").await;
        client.expect(452).await;
    }

    #[tokio::test]
    async fn transient_pipeline_failure_yields_451() {
        let sink = CollectingSink::new(SinkMode::Transient);
        let (mut client, _handle) =
            start(verified_inbox(), sink, test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
        client.send("RCPT TO:<u@verified.example>").await;
        client.expect(250).await;
        client.send("DATA").await;
        client.expect(354).await;
        client.send("Subject: x\r\n\r\nbody\r\n.").await;
        let reply = client.expect(451).await;
        assert!(reply.contains("4.3.0"));
    }

    #[tokio::test]
    async fn starttls_without_certificate_is_454() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) =
            start(verified_inbox(), sink, test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("STARTTLS").await;
        client.expect(454).await;
    }

    #[tokio::test]
    async fn rset_clears_envelope() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) =
            start(verified_inbox(), sink, test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<a@ext.com>").await;
        client.expect(250).await;
        client.send("RSET").await;
        client.expect(250).await;

        // envelope gone: RCPT needs MAIL again
        client.send("RCPT TO:<u@verified.example>").await;
        client.expect(503).await;
    }

    #[tokio::test]
    async fn invalid_sender_is_553() {
        let sink = CollectingSink::new(SinkMode::Accept);
        let (mut client, _handle) =
            start(verified_inbox(), sink, test_config(25 * 1024 * 1024, 100));

        client.expect(220).await;
        client.send("EHLO client.example").await;
        client.expect(250).await;
        client.send("MAIL FROM:<not-an-address>").await;
        client.expect(553).await;
    }
}
