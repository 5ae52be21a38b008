//! Persisted message cache and account cursor records
//!
//! [`MailStore`] is the storage seam the sync engine and read path depend on;
//! [`SqliteStore`] implements it with `rusqlite`. Messages are unique on
//! `(account_id, uid, epoch)` and every write path goes through an upsert on
//! that key, so replaying a sync never duplicates rows.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::models::{Account, CachedMessage};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    host TEXT NOT NULL,
    port INTEGER NOT NULL DEFAULT 993,
    username TEXT NOT NULL,
    secret TEXT NOT NULL,
    use_tls_direct INTEGER NOT NULL DEFAULT 1,
    use_starttls INTEGER NOT NULL DEFAULT 0,
    last_uid INTEGER NOT NULL DEFAULT 0,
    last_epoch INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_accounts_host ON accounts(host);

CREATE TABLE IF NOT EXISTS messages (
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    uid INTEGER NOT NULL,
    epoch INTEGER NOT NULL,
    subject TEXT NOT NULL DEFAULT '',
    from_addr TEXT NOT NULL DEFAULT '',
    msg_date INTEGER,
    flags TEXT NOT NULL DEFAULT '',
    body_html TEXT,
    body_plain TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE(account_id, uid, epoch)
);
CREATE INDEX IF NOT EXISTS idx_messages_account_date ON messages(account_id, msg_date DESC);
";

const MESSAGE_COLUMNS: &str =
    "account_id, uid, epoch, subject, from_addr, msg_date, flags, body_html, body_plain, created_at";

const ACCOUNT_COLUMNS: &str = "id, host, port, username, secret, use_tls_direct, use_starttls, \
     last_uid, last_epoch, created_at";

/// Everything one successful sync writes, applied atomically
#[derive(Debug, Clone)]
pub struct SyncCommit {
    pub account_id: String,
    /// Epoch the new rows and the watermark belong to
    pub epoch: u32,
    /// Delete every cached row for the account first (epoch rollover)
    pub purge: bool,
    pub messages: Vec<CachedMessage>,
    /// New watermark
    pub last_uid: u32,
}

/// Storage seam for accounts and cached messages
pub trait MailStore: Send + Sync {
    fn insert_account(&self, account: &Account) -> AppResult<()>;
    fn get_account(&self, id: &str) -> AppResult<Option<Account>>;
    /// Most recently registered account
    fn latest_account(&self) -> AppResult<Option<Account>>;
    /// Accounts newest first
    fn list_accounts(&self, limit: u32, offset: u32) -> AppResult<Vec<Account>>;
    fn count_accounts(&self) -> AppResult<u64>;
    /// Replace username and encrypted secret; `false` if the account is unknown
    fn update_credentials(&self, id: &str, username: &str, secret: &str) -> AppResult<bool>;
    /// Delete an account and, by cascade, its cached messages
    fn delete_account(&self, id: &str) -> AppResult<bool>;

    /// Insert or replace the row keyed by `(account_id, uid, epoch)`
    fn upsert(&self, message: &CachedMessage) -> AppResult<()>;
    /// Cached messages by date, newest first, undated last
    fn list_recent(&self, account_id: &str, limit: u32, offset: u32)
    -> AppResult<Vec<CachedMessage>>;
    fn count(&self, account_id: &str) -> AppResult<u64>;
    /// # Errors
    ///
    /// `NotFound` if no row exists for the UID.
    fn get_by_uid(&self, account_id: &str, uid: u32) -> AppResult<CachedMessage>;
    fn delete_all(&self, account_id: &str) -> AppResult<usize>;

    /// Empty mailbox: drop all rows and set the cursor to `(0, epoch)`
    fn reset_mailbox(&self, account_id: &str, epoch: u32) -> AppResult<()>;
    /// Apply a sync in one transaction; on error nothing is written
    fn commit_sync(&self, commit: &SyncCommit) -> AppResult<()>;
}

/// Run a store call on the blocking thread pool
///
/// SQLite I/O and the connection mutex stay off the async workers.
pub async fn run_blocking<T, F>(store: &Arc<dyn MailStore>, call: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn MailStore) -> AppResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(store.as_ref()))
        .await
        .map_err(|e| AppError::Internal(format!("store task failed: {e}")))?
}

/// SQLite-backed [`MailStore`]
///
/// One connection behind a mutex; statements are short and never span an
/// await point.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MailStore for SqliteStore {
    fn insert_account(&self, account: &Account) -> AppResult<()> {
        self.conn().execute(
            &format!("INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                account.id,
                account.host,
                account.port,
                account.username,
                account.encrypted_secret,
                account.use_tls_direct,
                account.use_starttls,
                account.last_uid,
                account.last_epoch,
                account.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn get_account(&self, id: &str) -> AppResult<Option<Account>> {
        let account = self
            .conn()
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    fn latest_account(&self) -> AppResult<Option<Account>> {
        let account = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                [],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    fn list_accounts(&self, limit: u32, offset: u32) -> AppResult<Vec<Account>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts
             ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt.query_map(params![limit, offset], account_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count_accounts(&self) -> AppResult<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn update_credentials(&self, id: &str, username: &str, secret: &str) -> AppResult<bool> {
        let changed = self.conn().execute(
            "UPDATE accounts SET username = ?1, secret = ?2 WHERE id = ?3",
            params![username, secret, id],
        )?;
        Ok(changed > 0)
    }

    fn delete_account(&self, id: &str) -> AppResult<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn upsert(&self, message: &CachedMessage) -> AppResult<()> {
        upsert_row(&self.conn(), message)
    }

    fn list_recent(
        &self,
        account_id: &str,
        limit: u32,
        offset: u32,
    ) -> AppResult<Vec<CachedMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE account_id = ?1
             ORDER BY msg_date IS NULL, msg_date DESC, uid DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![account_id, limit, offset], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count(&self, account_id: &str) -> AppResult<u64> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn get_by_uid(&self, account_id: &str, uid: u32) -> AppResult<CachedMessage> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE account_id = ?1 AND uid = ?2
                     ORDER BY epoch DESC LIMIT 1"
                ),
                params![account_id, uid],
                message_from_row,
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("cached message uid {uid} not found")))
    }

    fn delete_all(&self, account_id: &str) -> AppResult<usize> {
        let removed = self
            .conn()
            .execute("DELETE FROM messages WHERE account_id = ?1", params![account_id])?;
        Ok(removed)
    }

    fn reset_mailbox(&self, account_id: &str, epoch: u32) -> AppResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM messages WHERE account_id = ?1", params![account_id])?;
        update_cursor(&tx, account_id, 0, epoch)?;
        tx.commit()?;
        debug!(account_id, epoch, removed, "mailbox empty; cache reset");
        Ok(())
    }

    fn commit_sync(&self, commit: &SyncCommit) -> AppResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if commit.purge {
            let removed = tx.execute(
                "DELETE FROM messages WHERE account_id = ?1",
                params![commit.account_id],
            )?;
            debug!(account_id = %commit.account_id, removed, "purged rows from previous epoch");
        }
        for message in &commit.messages {
            upsert_row(&tx, message)?;
        }
        update_cursor(&tx, &commit.account_id, commit.last_uid, commit.epoch)?;
        // Dropping `tx` without commit rolls back.
        tx.commit()?;
        Ok(())
    }
}

fn update_cursor(conn: &Connection, account_id: &str, last_uid: u32, epoch: u32) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE accounts SET last_uid = ?1, last_epoch = ?2 WHERE id = ?3",
        params![last_uid, epoch, account_id],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("account '{account_id}' not found")));
    }
    Ok(())
}

fn upsert_row(conn: &Connection, m: &CachedMessage) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(account_id, uid, epoch) DO UPDATE SET
                 subject = excluded.subject,
                 from_addr = excluded.from_addr,
                 msg_date = excluded.msg_date,
                 flags = excluded.flags,
                 body_html = excluded.body_html,
                 body_plain = excluded.body_plain"
        ),
        params![
            m.account_id,
            m.uid,
            m.epoch,
            m.subject,
            m.from,
            m.date.map(|d| d.timestamp()),
            m.flags.join(" "),
            m.body_html,
            m.body_plain,
            m.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        host: row.get(1)?,
        port: row.get(2)?,
        username: row.get(3)?,
        encrypted_secret: row.get(4)?,
        use_tls_direct: row.get(5)?,
        use_starttls: row.get(6)?,
        last_uid: row.get(7)?,
        last_epoch: row.get(8)?,
        created_at: millis_to_utc(row.get(9)?),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<CachedMessage> {
    let flags: String = row.get(6)?;
    let date: Option<i64> = row.get(5)?;
    Ok(CachedMessage {
        account_id: row.get(0)?,
        uid: row.get(1)?,
        epoch: row.get(2)?,
        subject: row.get(3)?,
        from: row.get(4)?,
        date: date.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        flags: flags.split_whitespace().map(str::to_owned).collect(),
        body_html: row.get(7)?,
        body_plain: row.get(8)?,
        created_at: millis_to_utc(row.get(9)?),
    })
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
