//! Records and DTOs shared across the mirror
//!
//! `Account` and `CachedMessage` mirror the SQLite rows. `MessageView` and
//! `AccountInfo` are the display-ready shapes handed to callers; neither ever
//! carries a secret.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::mime;

/// How the transport to the mail server is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS from the first byte (IMAPS, usually port 993)
    Direct,
    /// Plaintext greeting upgraded with STARTTLS (usually port 143)
    StartTls,
    /// No transport security
    Plain,
}

impl TlsMode {
    /// Split into the persisted `(use_tls_direct, use_starttls)` flags
    pub fn flags(self) -> (bool, bool) {
        match self {
            Self::Direct => (true, false),
            Self::StartTls => (false, true),
            Self::Plain => (false, false),
        }
    }

    /// Rebuild from persisted flags; direct TLS wins if both are set
    pub fn from_flags(use_tls_direct: bool, use_starttls: bool) -> Self {
        if use_tls_direct {
            Self::Direct
        } else if use_starttls {
            Self::StartTls
        } else {
            Self::Plain
        }
    }
}

/// Registered mail account and its sync cursor
///
/// `last_uid` is only meaningful relative to `last_epoch` (the mailbox
/// UIDVALIDITY). Only the sync engine moves the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// `base64(nonce ‖ ciphertext ‖ tag)`
    pub encrypted_secret: String,
    pub use_tls_direct: bool,
    pub use_starttls: bool,
    pub last_uid: u32,
    pub last_epoch: u32,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn tls_mode(&self) -> TlsMode {
        TlsMode::from_flags(self.use_tls_direct, self.use_starttls)
    }
}

/// Input for account registration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_tls_mode")]
    pub tls_mode: TlsMode,
}

fn default_tls_mode() -> TlsMode {
    TlsMode::Direct
}

/// Input for credential rotation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsUpdate {
    pub username: Option<String>,
    pub password: String,
}

/// Account metadata (no credentials)
///
/// The sync cursor is omitted from compact listings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub tls_mode: TlsMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_epoch: Option<u32>,
    pub created_at: String,
}

impl AccountInfo {
    pub fn compact(self) -> Self {
        Self {
            last_uid: None,
            last_epoch: None,
            ..self
        }
    }
}

impl From<&Account> for AccountInfo {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id.clone(),
            host: a.host.clone(),
            port: a.port,
            username: a.username.clone(),
            tls_mode: a.tls_mode(),
            last_uid: Some(a.last_uid),
            last_epoch: Some(a.last_epoch),
            created_at: format_date(&a.created_at),
        }
    }
}

/// One synchronized message as persisted
///
/// Unique on `(account_id, uid, epoch)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub account_id: String,
    pub uid: u32,
    pub epoch: u32,
    pub subject: String,
    pub from: String,
    pub date: Option<DateTime<Utc>>,
    pub flags: Vec<String>,
    pub body_html: Option<String>,
    pub body_plain: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Display-ready message record
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MessageView {
    pub uid: u32,
    pub subject: String,
    pub from: String,
    pub date: Option<String>,
    pub flags: Vec<String>,
    pub snippet: String,
    pub body: String,
}

impl From<&CachedMessage> for MessageView {
    fn from(m: &CachedMessage) -> Self {
        Self {
            uid: m.uid,
            subject: m.subject.clone(),
            from: m.from.clone(),
            date: m.date.as_ref().map(format_date),
            flags: m.flags.clone(),
            snippet: mime::snippet_of(m.body_html.as_deref(), m.body_plain.as_deref()),
            body: mime::render_body(m.body_html.as_deref(), m.body_plain.as_deref()),
        }
    }
}

/// One page of messages plus the total the caller should report
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    pub total: u64,
}

/// RFC 3339 with second precision, UTC
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{CachedMessage, MessageView, TlsMode};

    #[test]
    fn tls_flags_roundtrip() {
        for mode in [TlsMode::Direct, TlsMode::StartTls, TlsMode::Plain] {
            let (direct, starttls) = mode.flags();
            assert_eq!(TlsMode::from_flags(direct, starttls), mode);
        }
        assert_eq!(TlsMode::from_flags(true, true), TlsMode::Direct);
    }

    #[test]
    fn view_escapes_plain_only_bodies() {
        let msg = CachedMessage {
            account_id: "a".to_owned(),
            uid: 7,
            epoch: 1,
            subject: "s".to_owned(),
            from: "f@example.com".to_owned(),
            date: Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()),
            flags: vec!["\\Seen".to_owned()],
            body_html: None,
            body_plain: Some("1 < 2\nok".to_owned()),
            created_at: Utc::now(),
        };
        let view = MessageView::from(&msg);
        assert_eq!(view.body, "1 &lt; 2<br>ok");
        assert_eq!(view.snippet, "1 < 2 ok");
        assert_eq!(view.date.as_deref(), Some("2025-01-02T03:04:05Z"));
    }
}
