//! Message body decoding and MIME handling
//!
//! Turns a raw RFC822 payload into display-ready markup using `mailparse`.
//! Decoding never fails: anything that does not parse is downgraded to the
//! escaped raw text. HTML bodies are sanitized with `ammonia`, plain bodies are
//! escaped, and every string passes through [`sanitize_utf8`].

use mailparse::body::Body;
use mailparse::{DispositionType, MailParseError, ParsedMail};
use thiserror::Error;
use tracing::debug;

/// Maximum characters kept in a snippet
pub const SNIPPET_MAX_CHARS: usize = 160;

/// Why a payload could not be walked as a MIME tree
///
/// Only ever logged; callers receive the degraded body instead.
#[derive(Debug, Error)]
enum DecodeError {
    #[error("payload is not a parsable message: {0}")]
    Parse(#[from] MailParseError),
    #[error("multipart payload without parsable parts")]
    EmptyMultipart,
}

/// Body candidates extracted from one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBody {
    /// First non-empty `text/html` part, sanitized
    pub html: Option<String>,
    /// First `text/plain` part, unescaped
    pub plain: Option<String>,
}

/// Decode a raw message payload into body candidates
///
/// Walks inline parts in order. The first non-empty HTML part and the first
/// plain part win; attachments are ignored. If the payload cannot be walked,
/// the whole raw stream becomes the plain candidate.
pub fn decode_body(raw: &[u8]) -> DecodedBody {
    match walk_message(raw) {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, bytes = raw.len(), "MIME decode degraded to raw text");
            DecodedBody {
                html: None,
                plain: Some(sanitize_utf8(raw)),
            }
        }
    }
}

fn walk_message(raw: &[u8]) -> Result<DecodedBody, DecodeError> {
    let parsed = mailparse::parse_mail(raw)?;
    if is_multipart(&parsed) && parsed.subparts.is_empty() {
        return Err(DecodeError::EmptyMultipart);
    }

    let mut body = DecodedBody::default();
    walk_parts(&parsed, &mut body);
    Ok(body)
}

fn is_multipart(part: &ParsedMail<'_>) -> bool {
    part.ctype.mimetype.to_ascii_lowercase().starts_with("multipart/")
}

/// Walk MIME part tree depth-first, capturing the first candidates
fn walk_parts(part: &ParsedMail<'_>, body: &mut DecodedBody) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, body);
        }
        return;
    }
    if is_multipart(part) {
        return;
    }
    if part.get_content_disposition().disposition == DispositionType::Attachment {
        return;
    }

    let ctype = part.ctype.mimetype.to_ascii_lowercase();
    if ctype.starts_with("text/html") {
        if body.html.is_none() {
            let html = decode_part_text(part);
            if !html.trim().is_empty() {
                body.html = Some(ammonia::clean(&html));
            }
        }
    } else if ctype.starts_with("text/plain") && body.plain.is_none() {
        body.plain = Some(decode_part_text(part));
    }
}

/// Decode one leaf part according to its transfer encoding
///
/// `base64` and `quoted-printable` are decoded; 7bit/8bit/binary bodies are
/// taken as-is. If decoding fails the raw bytes are used.
fn decode_part_text(part: &ParsedMail<'_>) -> String {
    let text = match part.get_body_encoded() {
        Body::Base64(encoded) | Body::QuotedPrintable(encoded) => encoded
            .get_decoded_as_string()
            .unwrap_or_else(|_| sanitize_utf8(encoded.get_raw())),
        Body::SevenBit(text) | Body::EightBit(text) => text
            .get_as_string()
            .unwrap_or_else(|_| sanitize_utf8(text.get_raw())),
        Body::Binary(binary) => sanitize_utf8(binary.get_raw()),
    };
    sanitize_text(&text)
}

/// Convert arbitrary bytes to valid Unicode
///
/// Invalid sequences become U+FFFD; NUL characters are dropped so the text is
/// safe for every storage backend and client.
pub fn sanitize_utf8(bytes: &[u8]) -> String {
    sanitize_text(&String::from_utf8_lossy(bytes))
}

/// Drop NUL characters from already-valid text
pub fn sanitize_text(text: &str) -> String {
    text.chars().filter(|c| *c != '\0').collect()
}

/// HTML-escape plain text and render newlines as `<br>`
pub fn escape_text(text: &str) -> String {
    html_escape::encode_safe(&text.replace("\r\n", "\n")).replace('\n', "<br>")
}

/// Select the display body from stored candidates
pub fn render_body(html: Option<&str>, plain: Option<&str>) -> String {
    match (html, plain) {
        (Some(h), _) if !h.is_empty() => h.to_owned(),
        (_, Some(p)) if !p.is_empty() => escape_text(p),
        _ => String::new(),
    }
}

/// Build a whitespace-collapsed preview from stored candidates
pub fn snippet_of(html: Option<&str>, plain: Option<&str>) -> String {
    let text = match (plain, html) {
        (Some(p), _) if !p.trim().is_empty() => p.to_owned(),
        (_, Some(h)) if !h.trim().is_empty() => {
            html2text::from_read(h.as_bytes(), 200).unwrap_or_default()
        }
        _ => String::new(),
    };
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(collapsed, SNIPPET_MAX_CHARS)
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
