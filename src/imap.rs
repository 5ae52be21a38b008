//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! [`ImapConnector`] implementation of the [`MailboxConnector`] seam. Direct
//! TLS, STARTTLS and plaintext transports are supported; all of them end up as
//! a boxed stream so the rest of the session code is transport-agnostic.

use std::fmt::Debug;
use std::sync::Arc;

use async_imap::imap_proto::{Response, Status};
use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::ImapTimeouts;
use crate::errors::{AppError, AppResult};
use crate::mailbox::{Envelope, FetchedMessage, MailboxConnector, MailboxSession, MailboxStatus};
use crate::mime::sanitize_utf8;
use crate::models::{Account, TlsMode};

/// Byte stream an IMAP client can run over
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> ImapStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

/// Type alias for an authenticated IMAP session over any transport
pub type ImapSession = Session<Box<dyn ImapStream>>;

/// Envelope, flags and UID for a sequence window
const ENVELOPE_QUERY: &str = "(UID FLAGS ENVELOPE)";
/// Full message without setting `\Seen`
const DETAIL_QUERY: &str = "(UID FLAGS ENVELOPE BODY.PEEK[])";

/// Open a transport to the account's server and read the greeting
///
/// Performs the connection sequence with timeouts:
/// 1. TCP connect
/// 2. Direct TLS handshake, or STARTTLS negotiation followed by a handshake,
///    or nothing for plaintext
/// 3. Read IMAP greeting (skipped after STARTTLS, the server already sent it)
///
/// # Errors
///
/// - `Timeout` if any connection phase times out
/// - `Connection` for TCP, TLS, greeting or STARTTLS failures
pub async fn connect(
    timeouts: &ImapTimeouts,
    account: &Account,
) -> AppResult<Client<Box<dyn ImapStream>>> {
    let tcp = timeout(
        timeouts.connect,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connection(format!("tcp connect failed: {e}"))))?;

    match account.tls_mode() {
        TlsMode::Direct => {
            let tls = tls_handshake(timeouts, &account.host, tcp).await?;
            let mut client = Client::new(Box::new(tls) as Box<dyn ImapStream>);
            read_greeting(timeouts, &mut client).await?;
            Ok(client)
        }
        TlsMode::StartTls => {
            let tcp = negotiate_starttls(timeouts, tcp).await?;
            let tls = tls_handshake(timeouts, &account.host, tcp).await?;
            Ok(Client::new(Box::new(tls) as Box<dyn ImapStream>))
        }
        TlsMode::Plain => {
            warn!(
                host = %account.host,
                "connecting without TLS; credentials are sent in cleartext"
            );
            let mut client = Client::new(Box::new(tcp) as Box<dyn ImapStream>);
            read_greeting(timeouts, &mut client).await?;
            Ok(client)
        }
    }
}

/// TLS handshake against the webpki root store
async fn tls_handshake<S>(
    timeouts: &ImapTimeouts,
    host: &str,
    stream: S,
) -> AppResult<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    timeout(timeouts.greeting, connector.connect(server_name, stream))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}"))))
}

/// How the server opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Greeting {
    Ready,
    PreAuthenticated,
    Other,
}

async fn read_greeting<S: ImapStream>(
    timeouts: &ImapTimeouts,
    client: &mut Client<S>,
) -> AppResult<Greeting> {
    let greeting = timeout(timeouts.greeting, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("IMAP greeting failed: {e}"))))?
        .ok_or_else(|| {
            AppError::Connection("IMAP server closed connection before greeting".to_owned())
        })?;

    match greeting.parsed() {
        Response::Data {
            status: Status::Ok, ..
        } => Ok(Greeting::Ready),
        Response::Data {
            status: Status::PreAuth,
            ..
        } => Ok(Greeting::PreAuthenticated),
        Response::Data {
            status: Status::Bye,
            information,
            ..
        } => Err(AppError::Connection(format!(
            "IMAP server refused connection: {}",
            information.as_deref().unwrap_or("BYE")
        ))),
        _ => Ok(Greeting::Other),
    }
}

/// Plaintext half of STARTTLS
///
/// Reads the greeting and runs `STARTTLS` through the IMAP client, then hands
/// back the raw stream for the TLS handshake. The server sends no second
/// greeting once TLS is up.
async fn negotiate_starttls<S: ImapStream>(timeouts: &ImapTimeouts, stream: S) -> AppResult<S> {
    let mut client = Client::new(stream);
    match read_greeting(timeouts, &mut client).await? {
        Greeting::Ready => {}
        Greeting::PreAuthenticated => {
            return Err(AppError::Connection(
                "server greeted with PREAUTH; STARTTLS is not allowed".to_owned(),
            ));
        }
        Greeting::Other => {
            return Err(AppError::Connection(
                "unexpected IMAP greeting before STARTTLS".to_owned(),
            ));
        }
    }

    timeout(
        timeouts.greeting,
        client.run_command_and_check_ok("STARTTLS", None),
    )
    .await
    .map_err(|_| AppError::Timeout("STARTTLS negotiation timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connection(format!("server refused STARTTLS: {e}"))))?;
    Ok(client.into_inner())
}

/// Authenticate with LOGIN
///
/// # Errors
///
/// - `Timeout` if LOGIN does not complete in time
/// - `Auth` if the server rejects the credentials
/// - `Protocol` for any other failure
pub async fn authenticate(
    timeouts: &ImapTimeouts,
    client: Client<Box<dyn ImapStream>>,
    username: &str,
    secret: &SecretString,
) -> AppResult<ImapSession> {
    timeout(timeouts.greeting, client.login(username, secret.expose_secret()))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                let lower = msg.to_ascii_lowercase();
                if lower.contains("auth")
                    || lower.contains("login")
                    || lower.contains("credential")
                    || lower.contains("no response")
                {
                    AppError::Auth(msg)
                } else {
                    AppError::Protocol(msg)
                }
            })
        })
}

/// Examine mailbox in read-only mode
///
/// Uses `EXAMINE` so nothing is marked as read. The mailbox name is encoded
/// as modified UTF-7.
pub async fn examine(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<MailboxStatus> {
    let encoded = utf7_imap::encode_utf7_imap(mailbox.to_owned());
    let selected = timeout(timeouts.socket, session.examine(&encoded))
        .await
        .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for mailbox '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::Protocol(format!("cannot examine mailbox '{mailbox}': {e}")))
        })?;
    let epoch = selected
        .uid_validity
        .ok_or_else(|| AppError::Protocol("mailbox missing UIDVALIDITY".to_owned()))?;
    Ok(MailboxStatus {
        exists: selected.exists,
        epoch,
    })
}

/// Fetch envelopes for a sequence range
///
/// Responses without a UID or envelope are skipped.
pub async fn fetch_envelopes(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    first: u32,
    last: u32,
) -> AppResult<Vec<Envelope>> {
    let stream = timeout(
        timeouts.socket,
        session.fetch(format!("{first}:{last}"), ENVELOPE_QUERY),
    )
    .await
    .map_err(|_| AppError::Timeout("FETCH timed out".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Protocol(format!("fetch failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(timeouts.socket, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("fetch stream failed: {e}"))))?;

    Ok(fetches.iter().filter_map(envelope_of).collect())
}

/// Fetch a single message with custom query
///
/// Runs a `UID FETCH` for a specific UID and returns the first result.
///
/// # Errors
///
/// - `NotFound` if UID does not exist in mailbox
/// - `Timeout` or `Protocol` for network/protocol errors
pub async fn fetch_one(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uid: u32,
    query: &str,
) -> AppResult<Fetch> {
    let stream = timeout(timeouts.socket, session.uid_fetch(uid.to_string(), query))
        .await
        .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid fetch failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(timeouts.socket, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid fetch stream failed: {e}"))))?;

    fetches
        .into_iter()
        .find(|f| f.uid == Some(uid))
        .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))
}

/// Fetch envelope and full source for one UID
pub async fn fetch_message(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uid: u32,
) -> AppResult<FetchedMessage> {
    let fetch = fetch_one(timeouts, session, uid, DETAIL_QUERY).await?;
    let envelope = envelope_of(&fetch)
        .ok_or_else(|| AppError::Protocol(format!("message uid {uid} has no envelope")))?;
    let raw = fetch
        .body()
        .ok_or_else(|| AppError::Protocol(format!("message uid {uid} has no body")))?
        .to_vec();
    Ok(FetchedMessage { envelope, raw })
}

/// Log out, ignoring failures
pub async fn logout(timeouts: &ImapTimeouts, mut session: ImapSession) {
    match timeout(timeouts.socket, session.logout()).await {
        Ok(Ok(())) => debug!("IMAP session logged out"),
        Ok(Err(e)) => debug!(error = %e, "IMAP logout failed"),
        Err(_) => debug!("IMAP logout timed out"),
    }
}

/// Convert one FETCH response to an [`Envelope`]
fn envelope_of(fetch: &Fetch) -> Option<Envelope> {
    let uid = fetch.uid?;
    let env = fetch.envelope()?;
    let from = env
        .from
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(|addr| {
            let mailbox = addr.mailbox.as_deref().map(sanitize_utf8).unwrap_or_default();
            match addr.host.as_deref() {
                Some(host) if !host.is_empty() => format!("{mailbox}@{}", sanitize_utf8(host)),
                _ => mailbox,
            }
        })
        .unwrap_or_default();

    Some(Envelope {
        uid,
        subject: env.subject.as_deref().map(decode_header_text).unwrap_or_default(),
        from,
        date: env.date.as_deref().and_then(parse_envelope_date),
        flags: flags_to_strings(fetch),
    })
}

/// Decode RFC 2047 encoded words in a raw header value
pub fn decode_header_text(raw: &[u8]) -> String {
    let mut line = b"Subject: ".to_vec();
    line.extend_from_slice(raw);
    match mailparse::parse_header(&line) {
        Ok((header, _)) => sanitize_utf8(header.get_value().as_bytes()),
        Err(_) => sanitize_utf8(raw),
    }
}

/// Parse an RFC 2822 envelope date to UTC
///
/// Strict RFC 2822 first, then `mailparse`'s lenient parser. The lenient
/// parser yields 0 for input it cannot read, which is treated as no date.
pub fn parse_envelope_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(text) {
        return Some(date.with_timezone(&Utc));
    }
    match mailparse::dateparse(text) {
        Ok(secs) if secs != 0 => DateTime::<Utc>::from_timestamp(secs, 0),
        _ => None,
    }
}

/// Convert fetch flags to their IMAP wire names
pub fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch.flags().map(|flag| flag_name(&flag)).collect()
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_owned(),
        Flag::Answered => "\\Answered".to_owned(),
        Flag::Flagged => "\\Flagged".to_owned(),
        Flag::Deleted => "\\Deleted".to_owned(),
        Flag::Draft => "\\Draft".to_owned(),
        Flag::Recent => "\\Recent".to_owned(),
        Flag::MayCreate => "\\*".to_owned(),
        Flag::Custom(name) => name.to_string(),
    }
}

/// Real IMAP implementation of [`MailboxConnector`]
#[derive(Debug, Clone)]
pub struct ImapConnector {
    timeouts: ImapTimeouts,
}

impl ImapConnector {
    pub fn new(timeouts: ImapTimeouts) -> Self {
        Self { timeouts }
    }
}

/// Authenticated IMAP session used by the sync engine
pub struct ImapMailbox {
    session: ImapSession,
    timeouts: ImapTimeouts,
}

impl MailboxConnector for ImapConnector {
    type Session = ImapMailbox;

    async fn connect(&self, account: &Account, secret: &SecretString) -> AppResult<ImapMailbox> {
        let client = connect(&self.timeouts, account).await?;
        debug!(account_id = %account.id, host = %account.host, "IMAP transport connected");
        let session = authenticate(&self.timeouts, client, &account.username, secret).await?;
        Ok(ImapMailbox {
            session,
            timeouts: self.timeouts,
        })
    }
}

impl MailboxSession for ImapMailbox {
    async fn examine(&mut self, mailbox: &str) -> AppResult<MailboxStatus> {
        examine(&self.timeouts, &mut self.session, mailbox).await
    }

    async fn fetch_envelopes(&mut self, first: u32, last: u32) -> AppResult<Vec<Envelope>> {
        fetch_envelopes(&self.timeouts, &mut self.session, first, last).await
    }

    async fn fetch_message(&mut self, uid: u32) -> AppResult<FetchedMessage> {
        fetch_message(&self.timeouts, &mut self.session, uid).await
    }

    async fn logout(self) {
        logout(&self.timeouts, self.session).await;
    }
}
