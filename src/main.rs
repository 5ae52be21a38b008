//! inbox-mirror: self-hosted IMAP mailbox mirror
//!
//! Mirrors a bounded window of recent messages from one read-only mailbox per
//! registered account into a local SQLite cache, and serves reads cache-first
//! with a synchronous sync and a live fetch as fallbacks.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and CLI dispatch
//! - [`config`]: Environment-driven settings
//! - [`errors`]: Application error model with HTTP error mapping
//! - [`vault`]: AES-256-GCM sealing of stored account secrets
//! - [`mime`]: Body decoding, sanitization and snippets
//! - [`mailbox`]: Protocol seam used by the sync engine
//! - [`imap`]: `async-imap` implementation of the seam with timeout wrappers
//! - [`store`]: SQLite message cache and account cursor records
//! - [`sync`]: Incremental UID-watermark sync engine
//! - [`service`]: Tiered read controller, account management, background refresh
//! - [`list_cache`]: TTL cache for listing responses
//! - [`server`]: HTTP routes

mod config;
mod errors;
mod imap;
mod list_cache;
mod mailbox;
mod mime;
mod models;
mod server;
mod service;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod vault;

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use errors::AppResult;
use imap::ImapConnector;
use models::{NewAccount, TlsMode};
use service::{MailService, ServiceOptions};
use store::SqliteStore;
use sync::SyncEngine;
use vault::Vault;

#[derive(Debug, Parser)]
#[command(name = "inbox-mirror", version, about = "Self-hosted IMAP mailbox mirror")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve,
    /// Register an IMAP account
    AddAccount {
        #[arg(long)]
        host: String,
        /// Defaults to 993
        #[arg(long, default_value_t = 0)]
        port: u16,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, value_enum, default_value_t = TlsArg::Direct)]
        tls: TlsArg,
    },
    /// List registered accounts
    Accounts {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Omit sync cursors
        #[arg(long)]
        compact: bool,
    },
    /// List recent messages (cache first)
    List {
        /// Account id; the newest account when omitted
        #[arg(long, default_value = "")]
        account: String,
        #[arg(long, default_value_t = 12)]
        limit: u32,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Show one message by UID
    Show {
        uid: u32,
        #[arg(long, default_value = "")]
        account: String,
    },
    /// Run one sync now
    Sync {
        #[arg(long, default_value = "")]
        account: String,
        /// Window size; defaults to INBOX_MIRROR_LIST_SYNC_LIMIT
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TlsArg {
    Direct,
    Starttls,
    Plain,
}

impl From<TlsArg> for TlsMode {
    fn from(arg: TlsArg) -> Self {
        match arg {
            TlsArg::Direct => Self::Direct,
            TlsArg::Starttls => Self::StartTls,
            TlsArg::Plain => Self::Plain,
        }
    }
}

/// Application entry point
///
/// Initializes tracing from environment (logs go to stderr, command output to
/// stdout), loads config and dispatches the subcommand.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load_from_env()?;
    let service = build_service(&config)?;

    match cli.command {
        Command::Serve => serve(&config, service).await?,
        Command::AddAccount {
            host,
            port,
            username,
            password,
            tls,
        } => {
            let info = service.register_account(NewAccount {
                host,
                port,
                username,
                password,
                tls_mode: tls.into(),
            })?;
            print_json(&info)?;
        }
        Command::Accounts {
            page,
            limit,
            compact,
        } => print_json(&service.list_accounts(page, limit, compact)?)?,
        Command::List {
            account,
            limit,
            page,
        } => {
            let listing = service.list_messages(&account, limit, page).await;
            service.drain().await;
            print_json(&listing?)?;
        }
        Command::Show { uid, account } => {
            let message = service.get_message(&account, uid).await;
            service.drain().await;
            print_json(&message?)?;
        }
        Command::Sync { account, limit } => {
            let report = service.sync_account(&account, limit).await?;
            println!(
                "epoch={} last_uid={} fetched={} inserted={} reset={}",
                report.epoch, report.last_uid, report.fetched, report.inserted, report.reset
            );
        }
    }
    Ok(())
}

fn build_service(config: &ServerConfig) -> AppResult<Arc<MailService<ImapConnector>>> {
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let vault = Vault::from_passphrase(config.secret.as_ref().map(|s| s.expose_secret()));
    let engine = SyncEngine::new(
        ImapConnector::new(config.timeouts),
        store,
        vault,
        config.mailbox.clone(),
    );
    Ok(Arc::new(MailService::new(
        engine,
        ServiceOptions::from(config),
    )?))
}

async fn serve(
    config: &ServerConfig,
    service: Arc<MailService<ImapConnector>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, db = %config.db_path, "inbox-mirror listening");
    axum::serve(listener, server::router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    service.shutdown().await;
    info!("background refreshes drained; bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c; shutting down");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
