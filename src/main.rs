//! Perp Mirror
//!
//! Mirrors externally submitted trade signals onto a USDⓈ-M futures
//! exchange for several isolated accounts and manages the resulting
//! positions: entry triggers, protective orders, trailing stops and
//! reconciliation with the exchange.

mod bot;
mod config;
mod credentials;
mod db;
mod engine;
mod exchange;
mod feeds;
mod models;
mod notify;
mod registry;
mod signing;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bot::run_accounts;
use crate::config::EngineConfig;
use crate::credentials::EnvCredentialStore;
use crate::db::Database;
use crate::models::{NewSignal, Side};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::registry::AccountRegistry;

/// Signal mirroring engine for futures accounts.
#[derive(Parser)]
#[command(name = "perpmirror")]
#[command(about = "Mirror trade signals onto futures accounts and manage their positions", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./perpmirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Webhook receiving operator notifications; logged only when absent
    #[arg(long, env = "PM_WEBHOOK_URL")]
    webhook_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => Side::Buy,
            SideArg::Sell => Side::Sell,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine for one or more accounts
    Run {
        /// Account ids, comma separated
        #[arg(short, long, env = "PM_ACCOUNTS", value_delimiter = ',', required = true)]
        accounts: Vec<i64>,
    },

    /// Submit a PENDING signal
    Signal {
        #[arg(short, long)]
        account: i64,

        /// Symbol, e.g. BTCUSDT
        #[arg(short, long)]
        symbol: String,

        #[arg(long, value_enum)]
        side: SideArg,

        /// Entry trigger price
        #[arg(long)]
        entry: f64,

        #[arg(long)]
        stop_loss: f64,

        #[arg(long)]
        tp1: f64,

        #[arg(long)]
        tp2: Option<f64>,

        #[arg(long)]
        tp3: Option<f64>,

        /// Base asset quantity; sized from PM_DEFAULT_NOTIONAL when absent
        #[arg(short, long)]
        quantity: Option<f64>,

        #[arg(long, default_value = "1")]
        leverage: i64,

        /// Candle timeframe (1m, 5m, 15m, 30m, 1h, 2h, 4h, 6h, 12h, 1d)
        #[arg(short, long)]
        timeframe: Option<String>,

        /// Cancel the signal if not triggered within this many minutes
        #[arg(long)]
        expires_in_mins: Option<i64>,

        /// Maximum lifetime in seconds
        #[arg(long)]
        max_lifetime_secs: Option<i64>,
    },

    /// Show signals, positions and orders of an account
    Status {
        #[arg(short, long)]
        account: i64,

        /// Number of recent signals to list
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Run one archival cycle for an account
    Archive {
        #[arg(short, long)]
        account: i64,

        /// Also reconcile ghosts and orphans against the exchange
        #[arg(long)]
        heavy: bool,
    },

    /// Show the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = EngineConfig::from_env()?;

    match cli.command {
        Commands::Run { accounts } => {
            let db = Database::new(&cli.database).await?;
            let notifier = build_notifier(cli.webhook_url.as_deref())?;
            let registry = Arc::new(AccountRegistry::new(
                db,
                notifier,
                config,
                Arc::new(EnvCredentialStore),
            ));

            info!(accounts = ?accounts, "Starting engine");
            println!("\n=== Perp Mirror ===");
            println!("Accounts: {:?}", accounts);
            println!("\nPress Ctrl+C to stop.\n");

            run_accounts(registry, &accounts).await?;
        }

        Commands::Signal {
            account,
            symbol,
            side,
            entry,
            stop_loss,
            tp1,
            tp2,
            tp3,
            quantity,
            leverage,
            timeframe,
            expires_in_mins,
            max_lifetime_secs,
        } => {
            let now = Utc::now();
            let signal = NewSignal {
                account_id: account,
                symbol: symbol.trim().to_uppercase(),
                side: side.into(),
                entry_price: entry,
                stop_loss,
                take_profit1: tp1,
                take_profit2: tp2,
                take_profit3: tp3,
                quantity,
                leverage,
                timeframe,
                expires_at: expires_in_mins.map(|m| now + Duration::minutes(m)),
                max_lifetime_secs,
            };
            signal.validate().context("Signal rejected")?;

            let db = Database::new(&cli.database).await?;
            let id = db.insert_signal(&signal, now).await?;
            info!(signal_id = id, account_id = account, symbol = %signal.symbol, "Signal submitted");
            println!(
                "Signal {} PENDING: {} {} entry {} SL {} TP1 {}",
                id, signal.symbol, signal.side, signal.entry_price, signal.stop_loss, signal.take_profit1
            );
        }

        Commands::Status { account, limit } => {
            let db = Database::new(&cli.database).await?;
            print_status(&db, account, limit).await?;
        }

        Commands::Archive { account, heavy } => {
            let db = Database::new(&cli.database).await?;
            let registry = AccountRegistry::new(db, Arc::new(LogNotifier), config, Arc::new(EnvCredentialStore));
            let context = registry.open(account).await?;

            let mut report = context.archival.run_light(Utc::now()).await?;
            if heavy {
                if let Err(e) = context.session.start().await {
                    // The gateway falls back to REST
                    info!(account_id = account, error = %e, "Session unavailable, reconciling over REST");
                }
                report.merge(context.archival.run_heavy().await?);
            }
            registry.close_all().await;

            println!("\n=== Archival (account {}) ===", account);
            println!("Expired signals:    {}", report.expired_signals);
            println!("Archived orders:    {}", report.archived_orders);
            println!("Archived positions: {}", report.archived_positions);
            if heavy {
                println!("Ghost positions:    {}", report.ghost_positions);
                println!("Orphan orders:      {}", report.orphan_orders);
            }
            println!("Failed units:       {}", report.failed_units);
        }

        Commands::Config => {
            println!("\n=== Engine Configuration ===\n");
            println!("Connections:");
            println!("  Connect Timeout:      {:?}", config.connect_timeout());
            println!("  Request Timeout:      {:?}", config.request_timeout());
            println!("  Price Cache TTL:      {:?}", config.price_ttl());
            println!("  Listen Key Keepalive: {:?}", config.listen_key_keepalive());

            println!("\nOrder Handling:");
            println!("  Settle Delay:         {:?}", config.settle_delay());
            println!("  Inter-call Delay:     {:?}", config.inter_call_delay());
            println!("  Trailing Interval:    {:?}", config.trailing_interval());
            println!("  Default Notional:     {} USDT", config.default_notional);

            println!("\nSchedules:");
            println!("  Health Check:         {:?}", config.health_check_interval());
            println!("  Unfed Signal Sweep:   {:?}", config.unfed_sweep_interval());
            println!("  Archival Cycle:       {:?}", config.archival_interval());
            println!("  Reconciliation Pass:  {:?}", config.heavy_pass_interval());
            println!("  Processing Timeout:   {:?}", config.processing_timeout());

            println!("\nNotifications:        {}", if cli.webhook_url.is_some() { "webhook" } else { "log" });
        }
    }

    Ok(())
}

fn build_notifier(webhook_url: Option<&str>) -> Result<Arc<dyn Notifier>> {
    Ok(match webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    })
}

async fn print_status(db: &Database, account_id: i64, limit: i64) -> Result<()> {
    let counts = db.table_counts(account_id).await?;

    println!("\n=== Account {} ===", account_id);
    println!("Pending Signals:    {}", counts.pending_signals);
    println!("Open Positions:     {}", counts.open_positions);
    println!("Active Orders:      {}", counts.active_orders);
    println!("Archived Positions: {}", counts.archived_positions);
    println!("Archived Orders:    {}", counts.archived_orders);

    let signals = db.recent_signals(account_id, limit).await?;
    if !signals.is_empty() {
        println!("\n=== Recent Signals ===");
        println!(
            "{:>6} {:<12} {:<5} {:>12} {:>12} {:<11} {}",
            "ID", "SYMBOL", "SIDE", "ENTRY", "STOP", "STATUS", "REASON"
        );
        for s in &signals {
            println!(
                "{:>6} {:<12} {:<5} {:>12} {:>12} {:<11} {}",
                s.id,
                s.symbol,
                s.side,
                s.entry_price,
                s.stop_loss,
                s.status.as_str(),
                truncate(s.error_message.as_deref().unwrap_or(""), 40)
            );
        }
    }

    let positions = db.open_positions(account_id).await?;
    if !positions.is_empty() {
        println!("\n=== Open Positions ===");
        for p in &positions {
            let pnl = p.unrealized_pnl();
            let sign = if pnl >= 0.0 { "+" } else { "" };
            println!(
                "  {} {} {} @ {} -> {} ({}{:.2}) [{}]",
                p.symbol,
                p.side,
                p.quantity,
                p.entry_price,
                p.current_price,
                sign,
                pnl,
                p.trailing_level.as_str()
            );
        }
    }

    let orders = db.active_orders(account_id).await?;
    if !orders.is_empty() {
        println!("\n=== Active Orders ===");
        for o in &orders {
            println!(
                "  {} {} {} {} stop {} [{}] {}",
                o.external_id,
                o.symbol,
                o.side,
                o.order_type.as_str(),
                o.stop_price,
                o.bot_role.as_str(),
                o.status.as_str()
            );
        }
    }

    Ok(())
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
