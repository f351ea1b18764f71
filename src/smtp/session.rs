use email_address::EmailAddress;
use smtp_proto::{
    EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EXT_PIPELINING, EXT_SIZE, EXT_START_TLS,
    EhloResponse, Request,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    ingest::{DataResult, IngestError, MessageSink, RecipientResolver},
    smtp::SmtpConfig,
};

/// Protocol states between commands. The DATA body phase is driven by the
/// connection loop through `SessionReply::IngestData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitEhlo,
    Ready,
    HaveSender,
    HaveRecipient,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    StartTls(u16, String),
}

struct Envelope {
    from: String,
    recipients: Vec<crate::models::ResolvedAlias>,
}

pub struct SmtpSession {
    config: Arc<SmtpConfig>,
    resolver: Arc<dyn RecipientResolver>,
    sink: Arc<dyn MessageSink>,
    peer_addr: SocketAddr,
    peer_name: Option<String>,
    state: State,
    envelope: Option<Envelope>,
    tls_active: bool,
    tls_available: bool,
}

impl SmtpSession {
    const RESPONSE_OK: &'static str = "2.0.0 OK";
    const RESPONSE_BYE: &'static str = "2.0.0 Goodbye";
    const RESPONSE_START_DATA: &'static str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_START_TLS: &'static str = "2.0.0 Ready to start TLS";
    const RESPONSE_SYNTAX_ERROR: &'static str = "5.5.2 Syntax error";
    const RESPONSE_BAD_SEQUENCE: &'static str = "5.5.1 Bad sequence of commands";
    const RESPONSE_HELLO_FIRST: &'static str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_MAIL_FIRST: &'static str = "5.5.1 Use MAIL first";
    const RESPONSE_NESTED_MAIL: &'static str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_INVALID_SENDER: &'static str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_RECIPIENT: &'static str = "5.1.3 This recipient address is not valid";
    const RESPONSE_UNKNOWN_RECIPIENT: &'static str = "5.1.1 No such mailbox here";
    const RESPONSE_TOO_MANY_RECIPIENTS: &'static str = "4.5.3 Too many recipients";
    const RESPONSE_NO_VALID_RECIPIENTS: &'static str = "5.5.1 No valid recipients";
    const RESPONSE_TLS_UNAVAILABLE: &'static str = "4.7.0 TLS not available due to local problem";
    const RESPONSE_ALREADY_TLS: &'static str = "5.5.1 TLS already active";
    const RESPONSE_NOT_IMPLEMENTED: &'static str = "5.5.1 Command not implemented";
    const RESPONSE_TRANSIENT_FAILURE: &'static str = "4.3.0 Temporary processing failure";
    const RESPONSE_MESSAGE_TOO_BIG: &'static str = "5.3.4 Message exceeds maximum size";

    pub fn new(
        peer_addr: SocketAddr,
        config: Arc<SmtpConfig>,
        resolver: Arc<dyn RecipientResolver>,
        sink: Arc<dyn MessageSink>,
        tls_available: bool,
    ) -> Self {
        Self {
            config,
            resolver,
            sink,
            peer_addr,
            peer_name: None,
            state: State::AwaitEhlo,
            envelope: None,
            tls_active: false,
            tls_available,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// RFC 3207: the TLS negotiation discards all knowledge from the
    /// plaintext phase; the client must greet again.
    pub fn reset_for_tls(&mut self) {
        self.peer_name = None;
        self.envelope = None;
        self.state = State::AwaitEhlo;
        self.tls_active = true;
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");
                return SessionReply::ReplyAndContinue(500, Self::RESPONSE_SYNTAX_ERROR.into());
            }
        };

        trace!("received request: {request:?} from {}", self.peer_addr);

        match request {
            Request::Ehlo { host } => {
                // RFC 5321, 4.1.1.1
                let mut response = EhloResponse::new(self.config.hostname.as_str());
                response.capabilities =
                    EXT_SIZE | EXT_8BIT_MIME | EXT_PIPELINING | EXT_ENHANCED_STATUS_CODES;
                if self.tls_available && !self.tls_active {
                    response.capabilities |= EXT_START_TLS;
                }
                response.size = self.config.max_message_size as usize;

                let mut buf = Vec::with_capacity(128);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);
                self.envelope = None;
                self.state = State::Ready;

                SessionReply::RawReply(buf)
            }
            Request::Helo { host } => {
                self.peer_name = Some(host);
                self.envelope = None;
                self.state = State::Ready;

                SessionReply::ReplyAndContinue(250, self.config.hostname.clone())
            }
            Request::Quit => {
                // RFC 5321, 4.1.1.10
                SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into())
            }
            Request::Noop { value: _ } => {
                // RFC 5321, 4.1.1.9
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Rset => {
                // RFC 5321, 4.1.1.5: clears the envelope, not the greeting
                self.envelope = None;
                if self.state != State::AwaitEhlo {
                    self.state = State::Ready;
                }
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::StartTls => {
                if self.tls_active {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_ALREADY_TLS.into());
                }
                if !self.tls_available {
                    return SessionReply::ReplyAndContinue(
                        454,
                        Self::RESPONSE_TLS_UNAVAILABLE.into(),
                    );
                }
                SessionReply::StartTls(220, Self::RESPONSE_START_TLS.into())
            }
            // nothing else is valid before the client said hello
            _ignored_command if self.state == State::AwaitEhlo => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => {
                // RFC 5321, 4.1.1.2
                debug!("received MAIL FROM: {}", from.address);

                if self.envelope.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }

                // the null reverse-path (bounces) is valid
                if !from.address.is_empty() && from.address.parse::<EmailAddress>().is_err() {
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_SENDER.into(),
                    );
                }

                self.envelope = Some(Envelope {
                    from: from.address,
                    recipients: Vec::new(),
                });
                self.state = State::HaveSender;

                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Rcpt { to } => {
                // RFC 5321, 4.1.1.3
                debug!("received RCPT TO: {}", to.address);

                let Some(envelope) = self.envelope.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
                };

                if envelope.recipients.len() >= self.config.max_recipients {
                    return SessionReply::ReplyAndContinue(
                        452,
                        Self::RESPONSE_TOO_MANY_RECIPIENTS.into(),
                    );
                }

                if to.address.parse::<EmailAddress>().is_err() {
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_RECIPIENT.into(),
                    );
                }

                match self.resolver.resolve_recipient(&to.address).await {
                    Ok(Some(resolved)) if resolved.accepts_mail() => {
                        let message = format!("2.1.5 Recipient <{}> ok", resolved.full_address);
                        self.envelope
                            .as_mut()
                            .expect("envelope checked above")
                            .recipients
                            .push(resolved);
                        self.state = State::HaveRecipient;

                        SessionReply::ReplyAndContinue(250, message)
                    }
                    Ok(_) => {
                        SessionReply::ReplyAndContinue(550, Self::RESPONSE_UNKNOWN_RECIPIENT.into())
                    }
                    Err(e) => {
                        debug!("recipient lookup failed: {e}");
                        SessionReply::ReplyAndContinue(451, Self::RESPONSE_TRANSIENT_FAILURE.into())
                    }
                }
            }
            Request::Data => {
                // RFC 5321, 4.1.1.4
                match self.envelope.as_ref() {
                    None => SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into()),
                    Some(envelope) if envelope.recipients.is_empty() => {
                        SessionReply::ReplyAndContinue(554, Self::RESPONSE_NO_VALID_RECIPIENTS.into())
                    }
                    Some(_) => SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into()),
                }
            }
            Request::Vrfy { value: _ } => {
                // RFC 5321, 4.1.1.6
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into())
            }
            Request::Lhlo { .. }
            | Request::Expn { .. }
            | Request::Help { .. }
            | Request::Auth { .. }
            | Request::Bdat { .. }
            | Request::Etrn { .. }
            | Request::Atrn { .. }
            | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into())
            }
        }
    }

    /// End of DATA. The 250 is written only after the pipeline reports
    /// durable acceptance; anything failing before the commit asks the
    /// client to retry with 451.
    pub async fn finish_data(&mut self, raw: Vec<u8>) -> (u16, String) {
        let Some(envelope) = self.envelope.take() else {
            return (503, Self::RESPONSE_BAD_SEQUENCE.into());
        };
        self.state = State::Ready;

        let queue_id = Uuid::new_v4();
        trace!(
            queue_id = queue_id.to_string(),
            bytes = raw.len(),
            "message data complete"
        );

        let data = DataResult {
            queue_id,
            from: envelope.from,
            recipients: envelope.recipients,
            raw,
        };

        match self.sink.ingest(data).await {
            Ok(receipt) => (250, format!("2.0.0 OK {}", receipt.queue_id)),
            Err(IngestError::Transient(reason)) => {
                debug!("transient ingestion failure: {reason}");
                (451, Self::RESPONSE_TRANSIENT_FAILURE.into())
            }
            Err(IngestError::Permanent(reason)) => (554, format!("5.3.0 {reason}")),
        }
    }

    /// DATA overran the size cap: the body was discarded, the envelope is
    /// dropped, and the session survives.
    pub fn abort_oversized_data(&mut self) -> (u16, String) {
        self.envelope = None;
        self.state = State::Ready;
        (552, Self::RESPONSE_MESSAGE_TOO_BIG.into())
    }
}
