use smtp_proto::Request;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::smtp::{
    SmtpConfig,
    session::{SessionReply, SmtpSession},
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
}

/// Why the command loop returned: either the session is over, or the
/// client asked for STARTTLS and the caller must upgrade the socket and
/// come back.
pub enum ConnectionOutcome {
    Closed,
    UpgradeTls,
}

const COMMAND_LINE_LIMIT: u64 = 2048;
const DATA_LINE_LIMIT: u64 = 8192;
const CODE_READY: u16 = 220;
const CODE_IDLE_TIMEOUT: u16 = 421;

pub async fn handle(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    session: &mut SmtpSession,
    config: &SmtpConfig,
    send_greeting: bool,
) -> Result<ConnectionOutcome, ConnectionError> {
    let (source, mut sink) = tokio::io::split(stream);

    // NOTE: we re-use this Vec<u8> to avoid re-allocating buffer
    let mut buffer = Vec::with_capacity(COMMAND_LINE_LIMIT as usize);
    let mut reader = BufReader::new(source);

    trace!("handling connection with {}", session.peer());

    if send_greeting {
        write_reply(
            CODE_READY,
            &format!("{} ESMTP", config.hostname),
            &mut sink,
        )
        .await?;
    }

    loop {
        match read_line_idle(&mut reader, &mut buffer, config.idle_timeout).await? {
            LineRead::Line => {}
            LineRead::IdleTimeout => {
                write_reply(CODE_IDLE_TIMEOUT, "4.4.2 Idle timeout, closing", &mut sink).await?;
                return Ok(ConnectionOutcome::Closed);
            }
            LineRead::TooLong => {
                write_reply(500, "5.5.2 Line too long", &mut sink).await?;
                continue;
            }
        }

        let request = Request::parse(&mut buffer.iter()).map(Request::into_owned);

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut sink).await?;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut sink).await?;
                return Ok(ConnectionOutcome::Closed);
            }
            SessionReply::RawReply(buf) => {
                sink.write_all(&buf).await.map_err(ConnectionError::Write)?;
            }
            SessionReply::StartTls(code, message) => {
                write_reply(code, &message, &mut sink).await?;
                return Ok(ConnectionOutcome::UpgradeTls);
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut sink).await?;

                let (code, message) = match read_data(
                    &mut reader,
                    config.max_message_size,
                    config.idle_timeout,
                )
                .await?
                {
                    DataOutcome::Complete(raw) => session.finish_data(raw).await,
                    DataOutcome::TooLarge => session.abort_oversized_data(),
                    DataOutcome::IdleTimeout => {
                        write_reply(CODE_IDLE_TIMEOUT, "4.4.2 Idle timeout, closing", &mut sink)
                            .await?;
                        return Ok(ConnectionOutcome::Closed);
                    }
                };
                write_reply(code, &message, &mut sink).await?;
            }
        }
    }
}

enum LineRead {
    Line,
    IdleTimeout,
    TooLong,
}

async fn read_line_idle(
    mut reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    idle_timeout: Duration,
) -> Result<LineRead, ConnectionError> {
    buffer.clear();

    let read = tokio::time::timeout(
        idle_timeout,
        (&mut reader)
            .take(COMMAND_LINE_LIMIT)
            .read_until(b'\n', buffer),
    )
    .await;

    let size = match read {
        Err(_) => return Ok(LineRead::IdleTimeout),
        Ok(result) => result.map_err(ConnectionError::Read)?,
    };

    if size == 0 {
        return Err(ConnectionError::Dropped);
    }

    if buffer.last() != Some(&b'\n') {
        // drain the oversized line so the next read starts clean
        loop {
            buffer.clear();
            let n = (&mut reader)
                .take(COMMAND_LINE_LIMIT)
                .read_until(b'\n', buffer)
                .await
                .map_err(ConnectionError::Read)?;
            if n == 0 {
                return Err(ConnectionError::Dropped);
            }
            if buffer.last() == Some(&b'\n') {
                break;
            }
        }
        buffer.clear();
        return Ok(LineRead::TooLong);
    }

    Ok(LineRead::Line)
}

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
    IdleTimeout,
}

/// Reads the message body until `<CRLF>.<CRLF>`, honoring dot-stuffing.
/// An over-limit body keeps draining to the terminator so the session can
/// answer 552 and carry on.
async fn read_data(
    mut reader: impl AsyncBufReadExt + Unpin,
    max_size: u64,
    idle_timeout: Duration,
) -> Result<DataOutcome, ConnectionError> {
    let mut body: Vec<u8> = Vec::new();
    let mut line: Vec<u8> = Vec::new();
    let mut at_line_start = true;
    let mut over_limit = false;

    loop {
        line.clear();
        let read = tokio::time::timeout(
            idle_timeout,
            (&mut reader).take(DATA_LINE_LIMIT).read_until(b'\n', &mut line),
        )
        .await;

        let size = match read {
            Err(_) => return Ok(DataOutcome::IdleTimeout),
            Ok(result) => result.map_err(ConnectionError::Read)?,
        };
        if size == 0 {
            return Err(ConnectionError::Dropped);
        }

        let complete_line = line.last() == Some(&b'\n');

        if at_line_start {
            if complete_line && (line == b".\r\n" || line == b".\n") {
                if over_limit {
                    return Ok(DataOutcome::TooLarge);
                }
                // the CRLF before the terminator belongs to it
                if body.ends_with(b"\r\n") {
                    body.truncate(body.len() - 2);
                } else if body.ends_with(b"\n") {
                    body.truncate(body.len() - 1);
                }
                debug!(bytes = body.len(), "received message data");
                return Ok(DataOutcome::Complete(body));
            }

            // transparency per RFC 5321, 4.5.2
            if line.first() == Some(&b'.') {
                line.remove(0);
            }
        }

        if !over_limit {
            body.extend_from_slice(&line);
            if body.len() as u64 > max_size {
                trace!("message data exceeds size cap, draining");
                over_limit = true;
                body.clear();
            }
        }

        at_line_start = complete_line;
    }
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
) -> Result<(), ConnectionError> {
    sink.write_all(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)?;

    debug!("sent: {} {}", code, message);

    Ok(())
}
