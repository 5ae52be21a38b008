//! Scripted in-memory mailbox for tests

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::errors::{AppError, AppResult};
use crate::mailbox::{Envelope, FetchedMessage, MailboxConnector, MailboxSession, MailboxStatus};
use crate::models::Account;
use crate::store::MailStore;
use crate::vault::Vault;

pub(crate) const TEST_PASSWORD: &str = "app-password";

pub(crate) fn test_vault() -> Vault {
    Vault::from_passphrase(Some("test passphrase"))
}

/// Insert an account whose secret decrypts to [`TEST_PASSWORD`]
pub(crate) fn registered_account(store: &dyn MailStore, vault: &Vault) -> Account {
    let mut account = crate::store::tests::account("acct-1");
    account.encrypted_secret = vault.encrypt(TEST_PASSWORD).expect("encrypt");
    store.insert_account(&account).expect("insert account");
    account
}

#[derive(Debug, Default)]
struct FakeState {
    epoch: u32,
    next_uid: u32,
    messages: Vec<u32>,
    hidden: HashSet<u32>,
    fail_connect: bool,
    reject_login: bool,
    fail_detail: bool,
    connect_delay: Option<Duration>,
    examine_delay: Option<Duration>,
    connects: usize,
    logouts: usize,
    detail_fetches: usize,
}

/// Shared handle onto the scripted server
#[derive(Debug, Clone)]
pub(crate) struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    pub(crate) fn new(epoch: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                epoch,
                next_uid: 1,
                ..FakeState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake server lock")
    }

    pub(crate) fn append_messages(&self, n: u32) {
        let mut state = self.lock();
        for _ in 0..n {
            let uid = state.next_uid;
            state.messages.push(uid);
            // leave UID gaps like a real server after expunges
            state.next_uid += 2;
        }
    }

    /// Replace the mailbox with a new UID generation holding `n` messages
    pub(crate) fn rollover(&self, epoch: u32, n: u32) {
        {
            let mut state = self.lock();
            state.epoch = epoch;
            state.messages.clear();
            state.next_uid = 1;
        }
        self.append_messages(n);
    }

    pub(crate) fn max_uid(&self) -> u32 {
        self.lock().messages.iter().copied().max().unwrap_or(0)
    }

    pub(crate) fn hide_detail(&self, uid: u32) {
        self.lock().hidden.insert(uid);
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub(crate) fn reject_login(&self, reject: bool) {
        self.lock().reject_login = reject;
    }

    pub(crate) fn fail_detail_fetches(&self, fail: bool) {
        self.lock().fail_detail = fail;
    }

    pub(crate) fn delay_connect(&self, delay: Duration) {
        self.lock().connect_delay = Some(delay);
    }

    pub(crate) fn delay_examine(&self, delay: Duration) {
        self.lock().examine_delay = Some(delay);
    }

    pub(crate) fn connects(&self) -> usize {
        self.lock().connects
    }

    pub(crate) fn logouts(&self) -> usize {
        self.lock().logouts
    }

    pub(crate) fn detail_fetches(&self) -> usize {
        self.lock().detail_fetches
    }
}

fn envelope(uid: u32) -> Envelope {
    Envelope {
        uid,
        subject: format!("message {uid}"),
        from: format!("sender{uid}@example.com"),
        date: Some(
            Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + ChronoDuration::minutes(uid.into()),
        ),
        flags: vec!["\\Seen".to_owned()],
    }
}

fn raw_message(uid: u32) -> Vec<u8> {
    format!(
        "From: sender{uid}@example.com\r\n\
         Subject: message {uid}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         message {uid} body\r\n"
    )
    .into_bytes()
}

#[derive(Debug, Clone)]
pub(crate) struct FakeConnector {
    server: FakeServer,
}

impl FakeConnector {
    pub(crate) fn new(server: FakeServer) -> Self {
        Self { server }
    }
}

pub(crate) struct FakeSession {
    server: FakeServer,
}

impl MailboxConnector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, _account: &Account, secret: &SecretString) -> AppResult<FakeSession> {
        let delay = {
            let mut state = self.server.lock();
            state.connects += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.server.lock();
        if state.fail_connect {
            return Err(AppError::Connection("connection refused".to_owned()));
        }
        if state.reject_login || secret.expose_secret() != TEST_PASSWORD {
            return Err(AppError::Auth("invalid credentials".to_owned()));
        }
        Ok(FakeSession {
            server: self.server.clone(),
        })
    }
}

impl MailboxSession for FakeSession {
    async fn examine(&mut self, _mailbox: &str) -> AppResult<MailboxStatus> {
        let delay = self.server.lock().examine_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.server.lock();
        Ok(MailboxStatus {
            exists: state.messages.len() as u32,
            epoch: state.epoch,
        })
    }

    async fn fetch_envelopes(&mut self, first: u32, last: u32) -> AppResult<Vec<Envelope>> {
        let state = self.server.lock();
        let from = first.saturating_sub(1) as usize;
        let to = (last as usize).min(state.messages.len());
        Ok(state.messages[from..to].iter().map(|&uid| envelope(uid)).collect())
    }

    async fn fetch_message(&mut self, uid: u32) -> AppResult<FetchedMessage> {
        let mut state = self.server.lock();
        state.detail_fetches += 1;
        if state.fail_detail {
            return Err(AppError::Protocol("unexpected FETCH response".to_owned()));
        }
        if state.hidden.contains(&uid) || !state.messages.contains(&uid) {
            return Err(AppError::NotFound(format!("uid {uid}")));
        }
        Ok(FetchedMessage {
            envelope: envelope(uid),
            raw: raw_message(uid),
        })
    }

    async fn logout(self) {
        self.server.lock().logouts += 1;
    }
}
