//! Protocol seam between the sync engine and a mail server
//!
//! The engine only needs a handful of session primitives: open an
//! authenticated session, examine one mailbox, fetch a window of envelopes by
//! sequence number, fetch one full message by UID, and log out. [`crate::imap`]
//! implements them over `async-imap`; tests implement them in memory.

use std::future::Future;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::errors::AppResult;
use crate::models::Account;

/// State of the examined mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Number of messages (`EXISTS`)
    pub exists: u32,
    /// UID generation (`UIDVALIDITY`)
    pub epoch: u32,
}

/// Envelope-level view of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub uid: u32,
    pub subject: String,
    pub from: String,
    pub date: Option<DateTime<Utc>>,
    pub flags: Vec<String>,
}

/// Envelope plus the full raw message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub envelope: Envelope,
    pub raw: Vec<u8>,
}

/// Opens authenticated sessions for an account
///
/// Covers the `Disconnected → Connected → Authenticated` part of a sync.
pub trait MailboxConnector: Send + Sync + 'static {
    type Session: MailboxSession;

    /// Connect (direct TLS, STARTTLS or plaintext per account) and log in
    ///
    /// # Errors
    ///
    /// - `Connection` / `Timeout` for transport or TLS failures
    /// - `Auth` if the server rejects the credentials
    fn connect(
        &self,
        account: &Account,
        secret: &SecretString,
    ) -> impl Future<Output = AppResult<Self::Session>> + Send;
}

/// An authenticated session
///
/// Dropped sessions are not logged out; callers must call [`Self::logout`].
pub trait MailboxSession: Send {
    /// Examine a mailbox read-only
    fn examine(&mut self, mailbox: &str) -> impl Future<Output = AppResult<MailboxStatus>> + Send;

    /// Fetch envelopes, flags and UIDs for sequence numbers `first..=last`
    fn fetch_envelopes(
        &mut self,
        first: u32,
        last: u32,
    ) -> impl Future<Output = AppResult<Vec<Envelope>>> + Send;

    /// Fetch one message by UID including its full body
    ///
    /// # Errors
    ///
    /// `NotFound` if the UID does not exist in the examined mailbox.
    fn fetch_message(&mut self, uid: u32)
    -> impl Future<Output = AppResult<FetchedMessage>> + Send;

    /// End the session; failures are logged, not returned
    fn logout(self) -> impl Future<Output = ()> + Send;
}

/// Sequence range covering the newest `min(exists, limit)` messages
///
/// Returns `None` for an empty mailbox or a zero limit.
pub fn recent_window(exists: u32, limit: u32) -> Option<(u32, u32)> {
    if exists == 0 || limit == 0 {
        return None;
    }
    let first = exists.saturating_sub(limit) + 1;
    Some((first, exists))
}
