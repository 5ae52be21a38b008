//! Configuration module for the mirror process
//!
//! All configuration is loaded from environment variables following the pattern
//! `INBOX_MIRROR_<KEY>`. A `.env` file is honored by the entry point before this
//! module runs. Mail accounts are not configured here: they are registered at
//! runtime and stored with encrypted secrets.

use std::env;
use std::env::VarError;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Timeouts applied to every phase of an IMAP session
#[derive(Debug, Clone, Copy)]
pub struct ImapTimeouts {
    /// TCP connect timeout
    pub connect: Duration,
    /// Greeting, TLS handshake, STARTTLS and LOGIN timeout
    pub greeting: Duration,
    /// Per-command socket I/O timeout
    pub socket: Duration,
}

impl Default for ImapTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(30_000),
            greeting: Duration::from_millis(15_000),
            socket: Duration::from_millis(300_000),
        }
    }
}

/// Server-wide configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Passphrase the credential key is derived from (unset means dev default)
    pub secret: Option<SecretString>,
    /// SQLite database path
    pub db_path: String,
    /// HTTP listen address for `serve`
    pub listen_addr: String,
    /// The single monitored mailbox
    pub mailbox: String,
    /// IMAP timeouts
    pub timeouts: ImapTimeouts,
    /// Upper bound for one background refresh
    pub refresh_timeout: Duration,
    /// Sync window used by the list read path
    pub list_sync_limit: u32,
    /// Sync window used by the single-message read path
    pub detail_sync_limit: u32,
    /// Time-to-live for the account listing cache
    pub list_cache_ttl: Duration,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set but malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// INBOX_MIRROR_SECRET=change-me
    /// INBOX_MIRROR_DB_PATH=/var/lib/inbox-mirror/mirror.db
    /// INBOX_MIRROR_LISTEN_ADDR=0.0.0.0:8080
    /// INBOX_MIRROR_REFRESH_TIMEOUT_SECONDS=30
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let secret = optional_env("INBOX_MIRROR_SECRET")?.map(|s| SecretString::new(s.into()));
        let list_sync_limit = parse_u32_env("INBOX_MIRROR_LIST_SYNC_LIMIT", 50)?;
        let detail_sync_limit = parse_u32_env("INBOX_MIRROR_DETAIL_SYNC_LIMIT", 20)?;
        if list_sync_limit == 0 || detail_sync_limit == 0 {
            return Err(AppError::invalid("sync limits must be at least 1"));
        }

        Ok(Self {
            secret,
            db_path: optional_env("INBOX_MIRROR_DB_PATH")?
                .unwrap_or_else(|| "inbox-mirror.db".to_owned()),
            listen_addr: optional_env("INBOX_MIRROR_LISTEN_ADDR")?
                .unwrap_or_else(|| "127.0.0.1:8080".to_owned()),
            mailbox: optional_env("INBOX_MIRROR_MAILBOX")?.unwrap_or_else(|| "INBOX".to_owned()),
            timeouts: ImapTimeouts {
                connect: Duration::from_millis(parse_u64_env(
                    "INBOX_MIRROR_CONNECT_TIMEOUT_MS",
                    30_000,
                )?),
                greeting: Duration::from_millis(parse_u64_env(
                    "INBOX_MIRROR_GREETING_TIMEOUT_MS",
                    15_000,
                )?),
                socket: Duration::from_millis(parse_u64_env(
                    "INBOX_MIRROR_SOCKET_TIMEOUT_MS",
                    300_000,
                )?),
            },
            refresh_timeout: Duration::from_secs(parse_u64_env(
                "INBOX_MIRROR_REFRESH_TIMEOUT_SECONDS",
                30,
            )?),
            list_sync_limit,
            detail_sync_limit,
            list_cache_ttl: Duration::from_secs(parse_u64_env(
                "INBOX_MIRROR_LIST_CACHE_TTL_SECONDS",
                30,
            )?),
        })
    }
}

/// Read an optional environment variable, treating blank values as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a boolean flag value
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive.
pub fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u32` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u32`.
fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<u32>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u32 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
