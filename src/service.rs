//! Read/fallback controller and account management
//!
//! Reads go through three tiers:
//!
//! 1. the persisted cache; a hit is returned immediately and a bounded
//!    background refresh is scheduled for the next reader
//! 2. a synchronous sync followed by a second cache read
//! 3. a live one-shot fetch that bypasses the cache entirely
//!
//! Only when all three miss does the caller see an error, and it is the most
//! specific one observed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::list_cache::{ListCache, ListCacheStats, ListKey};
use crate::mailbox::MailboxConnector;
use crate::models::{
    Account, AccountInfo, CachedMessage, CredentialsUpdate, MessagePage, MessageView, NewAccount,
};
use crate::store::{MailStore, run_blocking};
use crate::sync::{SyncEngine, SyncReport};

/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: u32 = 100;
/// Port used when registration leaves it unset
const DEFAULT_IMAP_PORT: u16 = 993;
/// Hostname or IPv4 literal; no whitespace, no control characters
const HOST_PATTERN: &str = r"^[A-Za-z0-9](?:[A-Za-z0-9.\-]{0,251}[A-Za-z0-9])?$";

/// Tunables for the controller
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub list_sync_limit: u32,
    pub detail_sync_limit: u32,
    pub refresh_timeout: Duration,
    pub list_cache_ttl: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            list_sync_limit: 50,
            detail_sync_limit: 20,
            refresh_timeout: Duration::from_secs(30),
            list_cache_ttl: Duration::from_secs(30),
        }
    }
}

impl From<&ServerConfig> for ServiceOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            list_sync_limit: config.list_sync_limit,
            detail_sync_limit: config.detail_sync_limit,
            refresh_timeout: config.refresh_timeout,
            list_cache_ttl: config.list_cache_ttl,
        }
    }
}

/// One page of registered accounts
#[derive(Debug, Clone, Serialize)]
pub struct AccountPage {
    pub accounts: Vec<AccountInfo>,
    pub total: u64,
}

/// Liveness snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub accounts: u64,
    pub list_cache: ListCacheStats,
}

/// Entry point for every mailbox read and account write
pub struct MailService<C: MailboxConnector> {
    engine: Arc<SyncEngine<C>>,
    accounts: ListCache<AccountInfo>,
    refresher: RefreshScheduler,
    options: ServiceOptions,
    host_pattern: Regex,
}

impl<C: MailboxConnector> MailService<C> {
    /// # Errors
    ///
    /// `Internal` if the hostname pattern fails to compile.
    pub fn new(engine: SyncEngine<C>, options: ServiceOptions) -> AppResult<Self> {
        let host_pattern = Regex::new(HOST_PATTERN)
            .map_err(|e| AppError::Internal(format!("invalid hostname regex: {e}")))?;
        Ok(Self {
            engine: Arc::new(engine),
            accounts: ListCache::new(options.list_cache_ttl),
            refresher: RefreshScheduler::new(options.refresh_timeout),
            options,
            host_pattern,
        })
    }

    fn store(&self) -> &dyn MailStore {
        self.engine.store().as_ref()
    }

    /// Recent messages for an account, newest first
    ///
    /// An empty `account_id` selects the most recently registered account.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a limit outside `1..=100` or a zero page
    /// - `NotFound` if the account does not exist
    /// - the live-fetch error when every tier failed
    pub async fn list_messages(
        &self,
        account_id: &str,
        limit: u32,
        page: u32,
    ) -> AppResult<MessagePage> {
        validate_limit(limit)?;
        if page == 0 {
            return Err(AppError::invalid("page must be at least 1"));
        }
        let offset = (page - 1).saturating_mul(limit);
        let mut account = self.pick_account(account_id)?;

        if let Some(page) = self.cached_page(&account.id, limit, offset).await? {
            self.refresher
                .schedule(self.engine.clone(), account, self.options.list_sync_limit);
            return Ok(page);
        }

        if self.sync_in_foreground(&mut account, self.options.list_sync_limit).await
            && let Some(page) = self.cached_page(&account.id, limit, offset).await?
        {
            return Ok(page);
        }

        let live = self
            .engine
            .fetch_live_recent(&account, offset.saturating_add(limit))
            .await
            .map_err(|e| {
                warn!(account_id = %account.id, error = %e, "live listing failed");
                e
            })?;
        let messages: Vec<MessageView> = live.into_iter().skip(offset as usize).collect();
        let total = messages.len() as u64;
        debug!(account_id = %account.id, total, "served listing from live fetch");
        Ok(MessagePage { messages, total })
    }

    /// One message with its rendered body
    ///
    /// # Errors
    ///
    /// The live-fetch error if the message is in neither the cache nor the
    /// mailbox (`NotFound` when the server does not know the UID).
    pub async fn get_message(&self, account_id: &str, uid: u32) -> AppResult<MessageView> {
        if uid == 0 {
            return Err(AppError::invalid("uid must be at least 1"));
        }
        let mut account = self.pick_account(account_id)?;

        if let Some(message) = self.cached_message(&account.id, uid)? {
            self.refresher
                .schedule(self.engine.clone(), account, self.options.detail_sync_limit);
            return Ok(MessageView::from(&message));
        }

        if self.sync_in_foreground(&mut account, self.options.detail_sync_limit).await
            && let Some(message) = self.cached_message(&account.id, uid)?
        {
            return Ok(MessageView::from(&message));
        }

        self.engine
            .fetch_live_message(&account, uid)
            .await
            .map_err(|e| {
                warn!(account_id = %account.id, uid, error = %e, "live message fetch failed");
                e
            })
    }

    /// Tier 2; failures are logged and reported as `false`
    async fn sync_in_foreground(&self, account: &mut Account, limit: u32) -> bool {
        match self
            .refresher
            .run_detached(self.engine.clone(), account.clone(), limit)
            .await
        {
            Ok((synced, _)) => {
                *account = synced;
                true
            }
            Err(_) => false,
        }
    }

    async fn cached_page(
        &self,
        account_id: &str,
        limit: u32,
        offset: u32,
    ) -> AppResult<Option<MessagePage>> {
        let account_id = account_id.to_owned();
        run_blocking(self.engine.store(), move |store| {
            let rows = store.list_recent(&account_id, limit, offset)?;
            if rows.is_empty() {
                return Ok(None);
            }
            let total = store.count(&account_id)?;
            Ok(Some(MessagePage {
                messages: rows.iter().map(MessageView::from).collect(),
                total,
            }))
        })
        .await
    }

    fn cached_message(&self, account_id: &str, uid: u32) -> AppResult<Option<CachedMessage>> {
        match self.store().get_by_uid(account_id, uid) {
            Ok(message) => Ok(Some(message)),
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve an account id; blank means the most recently registered one
    pub fn pick_account(&self, account_id: &str) -> AppResult<Account> {
        let account_id = account_id.trim();
        if account_id.is_empty() {
            return self
                .store()
                .latest_account()?
                .ok_or_else(|| AppError::NotFound("no account registered".to_owned()));
        }
        self.store()
            .get_account(account_id)?
            .ok_or_else(|| AppError::NotFound(format!("account {account_id}")))
    }

    /// Validate, encrypt and persist a new account
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a blank or malformed host, a blank username or an
    /// empty password.
    pub fn register_account(&self, input: NewAccount) -> AppResult<AccountInfo> {
        let host = self.validate_host(&input.host)?;
        let username = validate_username(&input.username)?;
        if input.password.is_empty() {
            return Err(AppError::invalid("password must not be empty"));
        }
        let port = if input.port == 0 {
            DEFAULT_IMAP_PORT
        } else {
            input.port
        };
        let (use_tls_direct, use_starttls) = input.tls_mode.flags();

        let account = Account {
            id: Uuid::new_v4().to_string(),
            host,
            port,
            username,
            encrypted_secret: self.engine.vault().encrypt(&input.password)?,
            use_tls_direct,
            use_starttls,
            last_uid: 0,
            last_epoch: 0,
            created_at: Utc::now(),
        };
        self.store().insert_account(&account)?;
        self.accounts.invalidate_all();
        info!(account_id = %account.id, host = %account.host, port = account.port, "account registered");
        Ok(AccountInfo::from(&account))
    }

    /// Registered accounts, newest first, served through the listing cache
    pub fn list_accounts(&self, page: u32, limit: u32, compact: bool) -> AppResult<AccountPage> {
        validate_limit(limit)?;
        if page == 0 {
            return Err(AppError::invalid("page must be at least 1"));
        }
        let key = ListKey::new("accounts", "", page, limit, compact);
        if let Some(entry) = self.accounts.get(&key) {
            return Ok(AccountPage {
                accounts: entry.items,
                total: entry.total,
            });
        }

        let generation = self.accounts.generation();
        let offset = (page - 1).saturating_mul(limit);
        let accounts: Vec<AccountInfo> = self
            .store()
            .list_accounts(limit, offset)?
            .iter()
            .map(|a| {
                let info = AccountInfo::from(a);
                if compact { info.compact() } else { info }
            })
            .collect();
        let total = self.store().count_accounts()?;
        if !self.accounts.set(key, accounts.clone(), total, generation) {
            debug!("account listing changed while reading; page not cached");
        }
        Ok(AccountPage { accounts, total })
    }

    /// Replace the stored credentials of an account
    ///
    /// The cursor and cached messages are kept; the next sync simply logs in
    /// with the new secret.
    pub fn update_credentials(&self, account_id: &str, update: CredentialsUpdate) -> AppResult<()> {
        let account = self.pick_account(account_id)?;
        if update.password.is_empty() {
            return Err(AppError::invalid("password must not be empty"));
        }
        let username = match update.username.as_deref() {
            Some(u) => validate_username(u)?,
            None => account.username.clone(),
        };
        let secret = self.engine.vault().encrypt(&update.password)?;
        if !self.store().update_credentials(&account.id, &username, &secret)? {
            return Err(AppError::NotFound(format!("account {}", account.id)));
        }
        self.accounts.invalidate_all();
        info!(account_id = %account.id, "account credentials updated");
        Ok(())
    }

    /// Remove an account and every cached message of it
    pub fn delete_account(&self, account_id: &str) -> AppResult<()> {
        let account_id = account_id.trim();
        if account_id.is_empty() {
            return Err(AppError::invalid("account id must not be empty"));
        }
        let removed = self.store().delete_all(account_id)?;
        if !self.store().delete_account(account_id)? {
            return Err(AppError::NotFound(format!("account {account_id}")));
        }
        self.accounts.invalidate_all();
        info!(account_id, removed, "account deleted");
        Ok(())
    }

    /// Run one sync in the foreground and surface its error
    pub async fn sync_account(&self, account_id: &str, limit: Option<u32>) -> AppResult<SyncReport> {
        let limit = limit.unwrap_or(self.options.list_sync_limit);
        if limit == 0 {
            return Err(AppError::invalid("limit must be at least 1"));
        }
        let account = self.pick_account(account_id)?;
        let (_, report) = self
            .refresher
            .run_detached(self.engine.clone(), account, limit)
            .await?;
        Ok(report)
    }

    pub fn health(&self) -> AppResult<HealthReport> {
        Ok(HealthReport {
            status: "ok",
            accounts: self.store().count_accounts()?,
            list_cache: self.accounts.stats(),
        })
    }

    /// Wait for outstanding background refreshes to finish
    pub async fn drain(&self) {
        self.refresher.drain().await;
    }

    /// Cancel outstanding background refreshes and wait for them to stop
    pub async fn shutdown(&self) {
        self.refresher.shutdown().await;
    }

    fn validate_host(&self, host: &str) -> AppResult<String> {
        let host = host.trim();
        if host.is_empty() {
            return Err(AppError::invalid("host must not be empty"));
        }
        if !self.host_pattern.is_match(host) {
            return Err(AppError::invalid(
                "host must be a hostname or IPv4 address without whitespace",
            ));
        }
        Ok(host.to_owned())
    }
}

fn validate_limit(limit: u32) -> AppResult<()> {
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(AppError::InvalidInput(format!(
            "limit must be in range 1..{MAX_PAGE_LIMIT}"
        )));
    }
    Ok(())
}

fn validate_username(username: &str) -> AppResult<String> {
    let username = username.trim();
    if username.is_empty() {
        return Err(AppError::invalid("username must not be empty"));
    }
    if username.chars().any(char::is_control) {
        return Err(AppError::invalid(
            "username must not contain control characters",
        ));
    }
    Ok(username.to_owned())
}

/// Bounded, cancellable refresh-ahead tasks
///
/// At most one refresh per account is in flight; a request for an account that
/// is already refreshing is dropped. A foreground sync may still overlap.
/// Caller-awaited syncs run on the same tracker so shutdown waits for them.
struct RefreshScheduler {
    tracker: TaskTracker,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<HashSet<String>>>,
    timeout: Duration,
}

impl RefreshScheduler {
    fn new(timeout: Duration) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            timeout,
        }
    }

    /// Spawn a refresh; returns whether one was started
    fn schedule<C: MailboxConnector>(
        &self,
        engine: Arc<SyncEngine<C>>,
        mut account: Account,
        limit: u32,
    ) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let account_id = account.id.clone();
        let claim = match InFlight::claim(&self.in_flight, &account_id) {
            Some(claim) => claim,
            None => {
                debug!(account_id = %account_id, "background refresh already running");
                return false;
            }
        };

        let cancel = self.cancel.clone();
        let timeout = self.timeout;
        self.tracker.spawn(async move {
            let _claim = claim;
            match engine
                .sync_bounded(&mut account, limit, Some(timeout), &cancel)
                .await
            {
                Ok(report) => debug!(account_id = %account_id, inserted = report.inserted, "background refresh done"),
                Err(_) if cancel.is_cancelled() => {
                    debug!(account_id = %account_id, "background refresh cancelled");
                }
                Err(AppError::Timeout(_)) => warn!(account_id = %account_id, timeout_secs = timeout.as_secs(), "background refresh timed out"),
                Err(e) => debug!(account_id = %account_id, error = %e, "background refresh failed"),
            }
        });
        true
    }

    /// Run a caller-awaited sync as a tracked task
    ///
    /// The sync runs to completion, logout included, even if the caller stops
    /// waiting for it.
    async fn run_detached<C: MailboxConnector>(
        &self,
        engine: Arc<SyncEngine<C>>,
        mut account: Account,
        limit: u32,
    ) -> AppResult<(Account, SyncReport)> {
        let task = self.tracker.spawn(async move {
            let report = engine.sync(&mut account, limit).await?;
            Ok::<_, AppError>((account, report))
        });
        task.await
            .map_err(|e| AppError::Internal(format!("sync task failed: {e}")))?
    }

    async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Per-account claim released on drop
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    account_id: String,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<String>>>, account_id: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(account_id.to_owned()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            account_id: account_id.to_owned(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.account_id);
    }
}
