//! Mailbox sync engine
//!
//! One sync attempt walks `Disconnected → Connected → Authenticated →
//! MailboxSelected → Fetching → Committing → Idle`, or stops in `Failed`.
//! The session is logged out on every path once it exists. All database
//! writes of an attempt land in a single transaction, so a failed attempt
//! leaves the previous cursor untouched and the next attempt simply retries.
//!
//! Only UIDs above the watermark are fetched in full. Flag changes on messages
//! already below the watermark are not picked up.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::mailbox::{Envelope, FetchedMessage, MailboxConnector, MailboxSession, recent_window};
use crate::mime::{self, sanitize_text};
use crate::models::{Account, CachedMessage, MessageView, format_date};
use crate::store::{MailStore, SyncCommit, run_blocking};
use crate::vault::Vault;

/// Phase a sync attempt has reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Disconnected,
    Connected,
    Authenticated,
    MailboxSelected,
    Fetching,
    Committing,
    Idle,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::MailboxSelected => "mailbox_selected",
            Self::Fetching => "fetching",
            Self::Committing => "committing",
            Self::Idle => "idle",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Epoch observed on the server
    pub epoch: u32,
    /// Watermark after commit
    pub last_uid: u32,
    /// Envelopes in the fetch window
    pub fetched: usize,
    /// Rows written
    pub inserted: usize,
    /// Cached rows were dropped (empty mailbox or epoch rollover)
    pub reset: bool,
}

/// Drives sync attempts and live fetches for accounts
pub struct SyncEngine<C: MailboxConnector> {
    connector: C,
    store: Arc<dyn MailStore>,
    vault: Vault,
    mailbox: String,
}

impl<C: MailboxConnector> SyncEngine<C> {
    pub fn new(connector: C, store: Arc<dyn MailStore>, vault: Vault, mailbox: String) -> Self {
        Self {
            connector,
            store,
            vault,
            mailbox,
        }
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Mirror the newest `limit` messages of the account's mailbox
    ///
    /// On success `account` carries the committed cursor.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a zero limit, otherwise `Decrypt`, `Connection`,
    /// `Timeout`, `Auth`, `Protocol` or `Storage`. Nothing is written when an
    /// error is returned.
    pub async fn sync(&self, account: &mut Account, limit: u32) -> AppResult<SyncReport> {
        self.sync_bounded(account, limit, None, &CancellationToken::new())
            .await
    }

    /// [`Self::sync`] with an optional deadline and a cancellation token
    ///
    /// Both only interrupt connecting and the work inside the session; an
    /// opened session is always logged out before this returns. An
    /// interrupted attempt fails with `Timeout`.
    pub async fn sync_bounded(
        &self,
        account: &mut Account,
        limit: u32,
        budget: Option<Duration>,
        cancel: &CancellationToken,
    ) -> AppResult<SyncReport> {
        if limit == 0 {
            return Err(AppError::invalid("sync limit must be at least 1"));
        }
        let deadline = budget.map(|budget| Instant::now() + budget);
        let mut phase = SyncPhase::Disconnected;
        let result = self
            .sync_inner(account, limit, &mut phase, deadline, cancel)
            .await;
        match &result {
            Ok(report) => info!(
                account_id = %account.id,
                epoch = report.epoch,
                last_uid = report.last_uid,
                fetched = report.fetched,
                inserted = report.inserted,
                reset = report.reset,
                "mailbox sync finished"
            ),
            Err(e) => warn!(
                account_id = %account.id,
                phase = %phase,
                unreachable = e.is_connection_tier(),
                error = %e,
                "mailbox sync failed"
            ),
        }
        result
    }

    async fn sync_inner(
        &self,
        account: &mut Account,
        limit: u32,
        phase: &mut SyncPhase,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> AppResult<SyncReport> {
        let mut session = match bounded(self.open(account), deadline, cancel).await {
            Ok(session) => session,
            Err(e) => {
                // a rejected login means the transport itself was up
                if matches!(e, AppError::Auth(_)) {
                    advance(phase, SyncPhase::Connected, &account.id);
                }
                return Err(e);
            }
        };
        advance(phase, SyncPhase::Authenticated, &account.id);

        let result = bounded(
            self.run_session(&mut session, account, limit, phase),
            deadline,
            cancel,
        )
        .await;
        session.logout().await;
        if result.is_err() {
            advance(phase, SyncPhase::Failed, &account.id);
        }
        result
    }

    async fn run_session(
        &self,
        session: &mut C::Session,
        account: &mut Account,
        limit: u32,
        phase: &mut SyncPhase,
    ) -> AppResult<SyncReport> {
        let status = session.examine(&self.mailbox).await?;
        advance(phase, SyncPhase::MailboxSelected, &account.id);

        let Some((first, last)) = recent_window(status.exists, limit) else {
            advance(phase, SyncPhase::Committing, &account.id);
            let account_id = account.id.clone();
            run_blocking(&self.store, move |store| {
                store.reset_mailbox(&account_id, status.epoch)
            })
            .await?;
            account.last_uid = 0;
            account.last_epoch = status.epoch;
            advance(phase, SyncPhase::Idle, &account.id);
            return Ok(SyncReport {
                epoch: status.epoch,
                last_uid: 0,
                fetched: 0,
                inserted: 0,
                reset: true,
            });
        };

        let rollover = account.last_epoch != 0 && account.last_epoch != status.epoch;
        if rollover {
            info!(
                account_id = %account.id,
                previous = account.last_epoch,
                current = status.epoch,
                "UIDVALIDITY changed; cached messages will be replaced"
            );
        }
        let watermark = if rollover { 0 } else { account.last_uid };

        advance(phase, SyncPhase::Fetching, &account.id);
        let envelopes = session.fetch_envelopes(first, last).await?;
        let fetched = envelopes.len();

        let mut fresh: Vec<&Envelope> = envelopes.iter().filter(|e| e.uid > watermark).collect();
        fresh.sort_unstable_by_key(|e| e.uid);

        let mut messages = Vec::with_capacity(fresh.len());
        for envelope in fresh {
            match session.fetch_message(envelope.uid).await {
                Ok(detail) => {
                    messages.push(to_cached(&account.id, status.epoch, envelope, detail))
                }
                Err(AppError::NotFound(_)) => {
                    debug!(account_id = %account.id, uid = envelope.uid, "message vanished before detail fetch");
                }
                Err(e) => return Err(e),
            }
        }

        let last_uid = messages.iter().map(|m| m.uid).fold(watermark, u32::max);
        advance(phase, SyncPhase::Committing, &account.id);
        let inserted = messages.len();
        let commit = SyncCommit {
            account_id: account.id.clone(),
            epoch: status.epoch,
            purge: rollover,
            messages,
            last_uid,
        };
        run_blocking(&self.store, move |store| store.commit_sync(&commit)).await?;

        account.last_uid = last_uid;
        account.last_epoch = status.epoch;
        advance(phase, SyncPhase::Idle, &account.id);
        Ok(SyncReport {
            epoch: status.epoch,
            last_uid,
            fetched,
            inserted,
            reset: rollover,
        })
    }

    /// One-shot listing straight from the server, newest first
    ///
    /// Envelope data only; nothing is cached.
    pub async fn fetch_live_recent(
        &self,
        account: &Account,
        limit: u32,
    ) -> AppResult<Vec<MessageView>> {
        let mut session = self.open(account).await?;
        let result = live_recent(&mut session, &self.mailbox, limit).await;
        session.logout().await;
        result
    }

    /// One-shot fetch of a single message with its decoded body
    ///
    /// # Errors
    ///
    /// `NotFound` if the UID is not in the mailbox.
    pub async fn fetch_live_message(&self, account: &Account, uid: u32) -> AppResult<MessageView> {
        let mut session = self.open(account).await?;
        let result = live_message(&mut session, &self.mailbox, &account.id, uid).await;
        session.logout().await;
        result
    }

    async fn open(&self, account: &Account) -> AppResult<C::Session> {
        let secret = self.secret_for(account)?;
        self.connector.connect(account, &secret).await
    }

    fn secret_for(&self, account: &Account) -> AppResult<SecretString> {
        self.vault.decrypt(&account.encrypted_secret).map_err(|e| {
            warn!(
                account_id = %account.id,
                "stored secret cannot be decrypted; re-enter the account credentials"
            );
            e
        })
    }
}

async fn live_recent<S: MailboxSession>(
    session: &mut S,
    mailbox: &str,
    limit: u32,
) -> AppResult<Vec<MessageView>> {
    let status = session.examine(mailbox).await?;
    let Some((first, last)) = recent_window(status.exists, limit) else {
        return Ok(Vec::new());
    };
    let mut envelopes = session.fetch_envelopes(first, last).await?;
    envelopes.sort_unstable_by(|a, b| b.uid.cmp(&a.uid));
    Ok(envelopes.iter().map(envelope_view).collect())
}

async fn live_message<S: MailboxSession>(
    session: &mut S,
    mailbox: &str,
    account_id: &str,
    uid: u32,
) -> AppResult<MessageView> {
    let status = session.examine(mailbox).await?;
    let detail = session.fetch_message(uid).await?;
    let envelope = detail.envelope.clone();
    let cached = to_cached(account_id, status.epoch, &envelope, detail);
    Ok(MessageView::from(&cached))
}

/// Run `work` until it finishes, the deadline passes, or `cancel` fires
async fn bounded<T>(
    work: impl Future<Output = AppResult<T>>,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> AppResult<T> {
    let timed = async {
        match deadline {
            Some(at) => timeout_at(at, work)
                .await
                .unwrap_or_else(|_| Err(AppError::Timeout("sync deadline exceeded".to_owned()))),
            None => work.await,
        }
    };
    tokio::select! {
        () = cancel.cancelled() => Err(AppError::Timeout("sync cancelled".to_owned())),
        result = timed => result,
    }
}

fn advance(phase: &mut SyncPhase, next: SyncPhase, account_id: &str) {
    debug!(account_id, from = %phase, to = %next, "sync phase");
    *phase = next;
}

/// Build the cached row from the window envelope and the detail fetch
///
/// The detail envelope wins; the window envelope fills gaps.
fn to_cached(account_id: &str, epoch: u32, window: &Envelope, detail: FetchedMessage) -> CachedMessage {
    let FetchedMessage { envelope, raw } = detail;
    let body = mime::decode_body(&raw);
    let subject = if envelope.subject.is_empty() {
        &window.subject
    } else {
        &envelope.subject
    };
    let from = if envelope.from.is_empty() {
        &window.from
    } else {
        &envelope.from
    };
    CachedMessage {
        account_id: account_id.to_owned(),
        uid: envelope.uid,
        epoch,
        subject: sanitize_text(subject),
        from: sanitize_text(from),
        date: envelope.date.or(window.date),
        flags: envelope.flags.iter().map(|f| sanitize_text(f)).collect(),
        body_html: body.html,
        body_plain: body.plain,
        created_at: Utc::now(),
    }
}

fn envelope_view(envelope: &Envelope) -> MessageView {
    MessageView {
        uid: envelope.uid,
        subject: sanitize_text(&envelope.subject),
        from: sanitize_text(&envelope.from),
        date: envelope.date.as_ref().map(format_date),
        flags: envelope.flags.clone(),
        snippet: String::new(),
        body: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::SyncEngine;
    use crate::errors::AppError;
    use crate::models::Account;
    use crate::store::{MailStore, SqliteStore};
    use crate::testing::{FakeConnector, FakeServer, registered_account, test_vault};

    struct Harness {
        server: FakeServer,
        store: Arc<SqliteStore>,
        engine: SyncEngine<FakeConnector>,
        account: Account,
    }

    fn harness() -> Harness {
        let server = FakeServer::new(100);
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let vault = test_vault();
        let account = registered_account(store.as_ref(), &vault);
        let engine = SyncEngine::new(
            FakeConnector::new(server.clone()),
            store.clone(),
            vault,
            "INBOX".to_owned(),
        );
        Harness {
            server,
            store,
            engine,
            account,
        }
    }

    fn persisted_cursor(h: &Harness) -> (u32, u32) {
        let acc = h.store.get_account(&h.account.id).expect("get").expect("exists");
        (acc.last_uid, acc.last_epoch)
    }

    #[tokio::test]
    async fn empty_mailbox_resets_cache_and_cursor() {
        let mut h = harness();
        let report = h.engine.sync(&mut h.account, 50).await.expect("sync");
        assert!(report.reset);
        assert_eq!(h.account.last_uid, 0);
        assert_eq!(h.account.last_epoch, 100);
        assert_eq!(h.store.count(&h.account.id).expect("count"), 0);
        assert_eq!(persisted_cursor(&h), (0, 100));
        assert_eq!(h.server.logouts(), 1);
    }

    #[tokio::test]
    async fn incremental_sync_persists_only_new_messages() {
        let mut h = harness();
        h.server.append_messages(5);
        let report = h.engine.sync(&mut h.account, 50).await.expect("first sync");
        assert_eq!(report.inserted, 5);
        assert_eq!(h.store.count(&h.account.id).expect("count"), 5);
        assert_eq!(h.account.last_uid, h.server.max_uid());
        assert_eq!(persisted_cursor(&h), (h.server.max_uid(), 100));

        h.server.append_messages(2);
        let report = h.engine.sync(&mut h.account, 50).await.expect("second sync");
        assert_eq!(report.inserted, 2);
        assert_eq!(h.server.detail_fetches(), 7);
        assert_eq!(h.store.count(&h.account.id).expect("count"), 7);
        assert_eq!(h.account.last_uid, h.server.max_uid());
    }

    #[tokio::test]
    async fn resync_without_changes_is_idempotent() {
        let mut h = harness();
        h.server.append_messages(3);
        h.engine.sync(&mut h.account, 50).await.expect("first");
        let before = (h.store.count(&h.account.id).expect("count"), persisted_cursor(&h));

        let report = h.engine.sync(&mut h.account, 50).await.expect("second");
        assert_eq!(report.inserted, 0);
        assert!(!report.reset);
        let after = (h.store.count(&h.account.id).expect("count"), persisted_cursor(&h));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn epoch_change_replaces_every_cached_row() {
        let mut h = harness();
        h.server.append_messages(7);
        h.engine.sync(&mut h.account, 50).await.expect("first");
        assert_eq!(h.store.count(&h.account.id).expect("count"), 7);

        h.server.rollover(200, 3);
        let report = h.engine.sync(&mut h.account, 50).await.expect("after rollover");
        assert!(report.reset);
        assert_eq!(report.inserted, 3);
        let rows = h.store.list_recent(&h.account.id, 50, 0).expect("list");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|m| m.epoch == 200));
        assert_eq!(persisted_cursor(&h), (h.server.max_uid(), 200));
    }

    #[tokio::test]
    async fn window_takes_newest_messages_only() {
        let mut h = harness();
        h.server.append_messages(10);
        h.engine.sync(&mut h.account, 4).await.expect("sync");
        let mut uids: Vec<u32> = h
            .store
            .list_recent(&h.account.id, 50, 0)
            .expect("list")
            .iter()
            .map(|m| m.uid)
            .collect();
        uids.sort_unstable();
        let max = h.server.max_uid();
        assert_eq!(uids, vec![max - 6, max - 4, max - 2, max]);
    }

    #[tokio::test]
    async fn failed_detail_fetch_commits_nothing_and_logs_out() {
        let mut h = harness();
        h.server.append_messages(2);
        h.engine.sync(&mut h.account, 50).await.expect("first");
        let cursor = persisted_cursor(&h);

        h.server.append_messages(2);
        h.server.fail_detail_fetches(true);
        let err = h.engine.sync(&mut h.account, 50).await.expect_err("must fail");
        assert!(matches!(err, AppError::Protocol(_)));
        assert_eq!(h.store.count(&h.account.id).expect("count"), 2);
        assert_eq!(persisted_cursor(&h), cursor);
        assert_eq!(h.server.logouts(), 2);

        h.server.fail_detail_fetches(false);
        let report = h.engine.sync(&mut h.account, 50).await.expect("retry");
        assert_eq!(report.inserted, 2);
        assert_eq!(h.store.count(&h.account.id).expect("count"), 4);
    }

    #[tokio::test]
    async fn vanished_message_is_skipped() {
        let mut h = harness();
        h.server.append_messages(3);
        let gone = h.server.max_uid() - 2;
        h.server.hide_detail(gone);
        let report = h.engine.sync(&mut h.account, 50).await.expect("sync");
        assert_eq!(report.inserted, 2);
        assert!(h.store.get_by_uid(&h.account.id, gone).is_err());
        assert_eq!(h.account.last_uid, h.server.max_uid());
    }

    #[tokio::test]
    async fn undecryptable_secret_never_connects() {
        let mut h = harness();
        h.account.encrypted_secret = "bm90IGEgcmVhbCBzZWNyZXQgYXQgYWxs".to_owned();
        let err = h.engine.sync(&mut h.account, 50).await.expect_err("must fail");
        assert!(matches!(err, AppError::Decrypt(_)));
        assert!(err.is_connection_tier());
        assert_eq!(h.server.connects(), 0);
    }

    #[tokio::test]
    async fn auth_failure_surfaces_without_session() {
        let mut h = harness();
        h.server.reject_login(true);
        let err = h.engine.sync(&mut h.account, 50).await.expect_err("must fail");
        assert!(matches!(err, AppError::Auth(_)));
        assert_eq!(h.server.logouts(), 0);
    }

    #[tokio::test]
    async fn live_fetches_bypass_the_cache() {
        let h = harness();
        h.server.append_messages(3);
        let listed = h.engine.fetch_live_recent(&h.account, 2).await.expect("live list");
        let uids: Vec<u32> = listed.iter().map(|m| m.uid).collect();
        let max = h.server.max_uid();
        assert_eq!(uids, vec![max, max - 2]);

        let one = h.engine.fetch_live_message(&h.account, max).await.expect("live get");
        assert!(one.body.contains(&format!("message {max}")));
        assert_eq!(h.store.count(&h.account.id).expect("count"), 0);
        assert_eq!(h.server.logouts(), 2);
    }

    #[tokio::test]
    async fn deadline_inside_session_still_logs_out() {
        let mut h = harness();
        h.server.append_messages(2);
        h.server.delay_examine(Duration::from_secs(60));

        let err = h
            .engine
            .sync_bounded(
                &mut h.account,
                50,
                Some(Duration::from_millis(20)),
                &CancellationToken::new(),
            )
            .await
            .expect_err("deadline");
        assert!(matches!(err, AppError::Timeout(_)));
        assert_eq!(h.server.connects(), 1);
        assert_eq!(h.server.logouts(), 1);
        assert_eq!(persisted_cursor(&h), (0, 0));
    }

    #[tokio::test]
    async fn cancelled_sync_still_logs_out() {
        let mut h = harness();
        h.server.append_messages(2);
        h.server.delay_examine(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = h
            .engine
            .sync_bounded(&mut h.account, 50, None, &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, AppError::Timeout(_)));
        assert_eq!(h.server.logouts(), h.server.connects());
    }

    #[tokio::test]
    async fn zero_limit_is_rejected_without_touching_the_cache() {
        let mut h = harness();
        h.server.append_messages(3);
        h.engine.sync(&mut h.account, 50).await.expect("first");
        let cursor = persisted_cursor(&h);

        let err = h.engine.sync(&mut h.account, 0).await.expect_err("zero limit");
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(h.store.count(&h.account.id).expect("count"), 3);
        assert_eq!(persisted_cursor(&h), cursor);
        assert_eq!(h.server.connects(), 1);
    }
}
