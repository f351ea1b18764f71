use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

/// Longest header value kept for storage.
const MAX_HEADER_VALUE_LEN: usize = 1000;

/// Preview window in characters, including the `...` suffix.
const PREVIEW_LEN: usize = 200;
const PREVIEW_ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStage {
    Headers,
    Structure,
}

/// A recoverable parse failure. The pipeline decides whether to persist a
/// raw-only record; the parser itself never gives up.
#[derive(Debug, Clone, Serialize)]
pub struct ParseError {
    pub stage: ParseStage,
    pub message: String,
}

#[derive(Debug)]
pub struct AttachmentPart {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ParsedEmail {
    pub sender_addr: Option<String>,
    pub sender_name: Option<String>,
    pub to_addr: Option<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// Header map, original-case keys, first occurrence wins.
    pub headers: Map<String, Value>,
    pub preview: Option<String>,
    pub attachments: Vec<AttachmentPart>,
    pub size_bytes: usize,
    /// Headers dropped by injection screening.
    pub dropped_headers: Vec<String>,
    pub error: Option<ParseError>,
}

impl ParsedEmail {
    pub fn headers_json(&self) -> Value {
        Value::Object(self.headers.clone())
    }
}

/// Parses a raw RFC 5322 buffer into a normalized record plus attachment
/// parts. Always returns: on failure the result carries best-effort
/// fields and a `ParseError`.
pub fn parse(raw: &[u8]) -> ParsedEmail {
    let mut result = ParsedEmail {
        size_bytes: raw.len(),
        ..Default::default()
    };

    let dropped = screen_headers(raw);
    if !dropped.is_empty() {
        warn!(headers = ?dropped, "dropping headers with CR/LF injection");
        result.dropped_headers = dropped;
    }

    let Some(parsed) = MessageParser::default().parse(raw) else {
        result.error = Some(ParseError {
            stage: ParseStage::Structure,
            message: "message structure could not be parsed".to_string(),
        });
        return result;
    };

    let is_dropped = |name: &str| {
        result
            .dropped_headers
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    };

    if !is_dropped("From")
        && let Some(from) = parsed.from().and_then(first_addr)
    {
        result.sender_addr = from.address().map(str::to_string);
        result.sender_name = from.name().map(str::to_string);
    }

    if !is_dropped("To")
        && let Some(to) = parsed.to().and_then(first_addr)
    {
        result.to_addr = to.address().map(str::to_string);
    }

    if !is_dropped("Subject") {
        result.subject = parsed.subject().map(|s| truncate_chars(s, MAX_HEADER_VALUE_LEN));
    }

    // Decoded header map; duplicates keep the first occurrence.
    if let Some(root) = parsed.parts.first() {
        for header in &root.headers {
            let name = header.name.as_str();
            if is_dropped(name)
                || result.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
            {
                continue;
            }
            if let Some(value) = header_value_string(&header.value) {
                result.headers.insert(
                    name.to_string(),
                    Value::String(truncate_chars(&value, MAX_HEADER_VALUE_LEN)),
                );
            }
        }
    }

    // Body selection: first text/plain and text/html parts win; in
    // multipart/alternative mail-parser already prefers the richer part
    // while keeping both available.
    result.body_text = parsed.body_text(0).map(|b| b.into_owned());
    result.body_html = parsed.body_html(0).map(|b| b.into_owned());
    result.preview = result.body_text.as_deref().map(preview);

    for (index, part) in parsed.attachments().enumerate() {
        let filename = part
            .attachment_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("attachment-{}", index + 1));
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        result.attachments.push(AttachmentPart {
            filename,
            content_type,
            data: part.contents().to_vec(),
        });
    }

    result
}

fn first_addr<'a>(address: &'a Address<'a>) -> Option<&'a mail_parser::Addr<'a>> {
    match address {
        Address::List(list) => list.first(),
        Address::Group(groups) => groups.first().and_then(|g| g.addresses.first()),
    }
}

fn header_value_string(value: &HeaderValue) -> Option<String> {
    match value {
        HeaderValue::Text(text) => Some(text.to_string()),
        HeaderValue::TextList(list) => Some(list.join(", ")),
        HeaderValue::Address(address) => {
            let rendered = match address {
                Address::List(list) => render_addrs(list),
                Address::Group(groups) => groups
                    .iter()
                    .flat_map(|g| g.addresses.iter())
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(render_addr)
                    .collect::<Vec<_>>()
                    .join(", "),
            };
            Some(rendered)
        }
        HeaderValue::DateTime(dt) => Some(dt.to_rfc3339()),
        HeaderValue::ContentType(ct) => Some(match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        }),
        HeaderValue::Received(_) => None,
        HeaderValue::Empty => None,
    }
}

fn render_addrs(list: &[mail_parser::Addr]) -> String {
    list.iter()
        .map(render_addr)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_addr(addr: &mail_parser::Addr) -> String {
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Walks the raw header block and returns the names of headers carrying
/// CR/LF injection: a bare CR or LF outside folding whitespace, or the
/// percent-encoded `%0d`/`%0a` forms (any case).
fn screen_headers(raw: &[u8]) -> Vec<String> {
    let header_block = match find_header_end(raw) {
        Some(end) => &raw[..end],
        None => raw,
    };

    let mut dropped = Vec::new();
    let mut current: Option<(String, bool)> = None;

    let mut flush = |entry: &mut Option<(String, bool)>| {
        if let Some((name, bad)) = entry.take()
            && bad
            && !dropped.iter().any(|d: &String| d.eq_ignore_ascii_case(&name))
        {
            dropped.push(name);
        }
    };

    for line in header_block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let is_continuation = line[0] == b' ' || line[0] == b'\t';
        if !is_continuation {
            flush(&mut current);

            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            let bad = contains_injection(&line[colon + 1..]) || contains_injection(name.as_bytes());
            current = Some((name, bad));
        } else if let Some((_, bad)) = current.as_mut() {
            *bad |= contains_injection(line);
        }
    }
    flush(&mut current);

    dropped
}

fn contains_injection(bytes: &[u8]) -> bool {
    // Bare CR/LF: the physical line split already consumed legitimate
    // CRLF folds, so any control byte left over was smuggled in.
    if bytes.iter().any(|&b| b == b'\r' || b == b'\n') {
        return true;
    }

    bytes.windows(3).any(|w| {
        w[0] == b'%'
            && w[1] == b'0'
            && (w[2] == b'd' || w[2] == b'D' || w[2] == b'a' || w[2] == b'A')
    })
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n"))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// First ~200 characters of the whitespace-trimmed body. When truncating,
/// cut at the last whitespace of the window if it falls in the second
/// half, hard-cut otherwise; the `...` suffix keeps the total within the
/// window.
pub fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= PREVIEW_LEN {
        return trimmed.to_string();
    }

    let cap = PREVIEW_LEN - PREVIEW_ELLIPSIS.len();
    let window: String = trimmed.chars().take(cap).collect();

    let cut = window
        .char_indices()
        .filter(|(_, c)| c.is_whitespace())
        .map(|(i, _)| i)
        .next_back()
        .filter(|&i| window[..i].chars().count() > cap / 2);

    let prefix = match cut {
        Some(i) => &window[..i],
        None => window.as_str(),
    };

    format!("{}{PREVIEW_ELLIPSIS}", prefix.trim_end())
}

#[cfg(test)]
mod test {
    use super::*;

    fn plain_message() -> Vec<u8> {
        b"From: Jane Doe <jane@ext.example>\r\n\
          To: u@verified.example\r\n\
          Subject: Hi\r\n\
          \r\n\
          Hello"
            .to_vec()
    }

    #[test]
    fn parses_plain_message() {
        let parsed = parse(&plain_message());

        assert!(parsed.error.is_none());
        assert_eq!(parsed.sender_addr.as_deref(), Some("jane@ext.example"));
        assert_eq!(parsed.sender_name.as_deref(), Some("Jane Doe"));
        assert_eq!(parsed.to_addr.as_deref(), Some("u@verified.example"));
        assert_eq!(parsed.subject.as_deref(), Some("Hi"));
        assert_eq!(parsed.body_text.as_deref(), Some("Hello"));
        assert_eq!(parsed.size_bytes, plain_message().len());
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn decodes_encoded_word_display_name() {
        let raw = b"From: =?utf-8?B?SsO8cmdlbg==?= <j@ext.example>\r\n\
                    Subject: =?utf-8?Q?Gr=C3=BC=C3=9Fe?=\r\n\
                    \r\n\
                    hi";
        let parsed = parse(raw);

        assert_eq!(parsed.sender_name.as_deref(), Some("Jürgen"));
        assert_eq!(parsed.sender_addr.as_deref(), Some("j@ext.example"));
        assert_eq!(parsed.subject.as_deref(), Some("Grüße"));
    }

    #[test]
    fn multipart_alternative_prefers_html_keeps_both() {
        let raw = b"From: a@ext.example\r\n\
            Subject: alt\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
            \r\n\
            --b1\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            plain body\r\n\
            --b1\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <p>html body</p>\r\n\
            --b1--\r\n";
        let parsed = parse(raw);

        assert_eq!(parsed.body_text.as_deref().map(str::trim), Some("plain body"));
        assert_eq!(
            parsed.body_html.as_deref().map(str::trim),
            Some("<p>html body</p>")
        );
    }

    #[test]
    fn multipart_mixed_extracts_attachment() {
        let raw = b"From: a@ext.example\r\n\
            Subject: with attachment\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"b2\"\r\n\
            \r\n\
            --b2\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            see attached\r\n\
            --b2\r\n\
            Content-Type: application/pdf\r\n\
            Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            JVBERi0xLjQK\r\n\
            --b2--\r\n";
        let parsed = parse(raw);

        assert_eq!(parsed.body_text.as_deref().map(str::trim), Some("see attached"));
        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename, "report.pdf");
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.data, b"%PDF-1.4\n");
    }

    #[test]
    fn quoted_printable_body_round_trips() {
        let raw = b"From: a@ext.example\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            Content-Transfer-Encoding: quoted-printable\r\n\
            \r\n\
            caf=C3=A9 =3D tasty\r\n";
        let parsed = parse(raw);

        assert_eq!(
            parsed.body_text.as_deref().map(str::trim),
            Some("café = tasty")
        );
    }

    #[test]
    fn latin1_lifted_to_utf8() {
        let mut raw = b"From: a@ext.example\r\n\
            Content-Type: text/plain; charset=iso-8859-1\r\n\
            \r\n\
            caf"
            .to_vec();
        raw.push(0xE9); // é in latin-1
        let parsed = parse(&raw);

        assert_eq!(parsed.body_text.as_deref(), Some("café"));
    }

    #[test]
    fn injected_header_is_dropped() {
        let raw = b"From: a@ext.example\r\n\
            X-Evil: value%0d%0aBcc: victim@example.com\r\n\
            Subject: fine\r\n\
            \r\n\
            body";
        let parsed = parse(raw);

        assert_eq!(parsed.dropped_headers, vec!["X-Evil".to_string()]);
        assert!(!parsed.headers.keys().any(|k| k.eq_ignore_ascii_case("X-Evil")));
        assert_eq!(parsed.subject.as_deref(), Some("fine"));
    }

    #[test]
    fn injected_subject_clears_field() {
        let raw = b"From: a@ext.example\r\n\
            Subject: looks%0Ainnocent\r\n\
            \r\n\
            body";
        let parsed = parse(raw);

        assert!(parsed.subject.is_none());
        assert_eq!(parsed.dropped_headers, vec!["Subject".to_string()]);
    }

    #[test]
    fn bare_cr_in_header_is_injection() {
        let raw = b"From: a@ext.example\r\n\
            X-Weird: foo\rbar\r\n\
            \r\n\
            body";
        let parsed = parse(raw);

        assert_eq!(parsed.dropped_headers, vec!["X-Weird".to_string()]);
    }

    #[test]
    fn folded_header_is_not_injection() {
        let raw = b"From: a@ext.example\r\n\
            X-Long: first part\r\n\
            \tsecond part\r\n\
            \r\n\
            body";
        let parsed = parse(raw);

        assert!(parsed.dropped_headers.is_empty());
    }

    #[test]
    fn duplicate_headers_keep_first() {
        let raw = b"From: a@ext.example\r\n\
            X-Tag: one\r\n\
            X-Tag: two\r\n\
            \r\n\
            body";
        let parsed = parse(raw);

        assert_eq!(
            parsed.headers.get("X-Tag").and_then(|v| v.as_str()),
            Some("one")
        );
    }

    #[test]
    fn unparseable_message_keeps_raw() {
        let parsed = parse(b"");

        assert!(parsed.error.is_some());
        assert_eq!(parsed.size_bytes, 0);
    }

    #[test]
    fn preview_short_body_untouched() {
        assert_eq!(preview("  Hello world  "), "Hello world");
    }

    #[test]
    fn preview_truncates_at_whitespace() {
        let body = "word ".repeat(100);
        let result = preview(&body);

        assert!(result.ends_with("..."));
        assert!(result.chars().count() <= 200);
        let prefix = result.trim_end_matches("...");
        assert!(body.trim().starts_with(prefix));
        // cut happened at a word boundary
        assert!(!prefix.ends_with(' '));
        assert!(prefix.len() % 5 == 4, "prefix should end mid-run at a word");
    }

    #[test]
    fn preview_hard_cuts_unbroken_text() {
        let body = "x".repeat(500);
        let result = preview(&body);

        assert!(result.ends_with("..."));
        assert_eq!(result.chars().count(), 200);
    }

    #[test]
    fn preview_bound_holds_for_any_length() {
        for n in [0usize, 1, 199, 200, 201, 300] {
            let body = "a".repeat(n);
            let result = preview(&body);
            assert!(result.chars().count() <= n.min(200));
            if n <= 200 {
                assert_eq!(result, body);
            } else {
                assert!(result.ends_with("..."));
            }
        }
    }
}
