//! Account runner: health check and scheduled work for one account.
//!
//! Handles:
//! - Starting and healing the session, user stream and market feeds
//! - Expiring signals on symbols without a price feed
//! - Light archival cycles and heavy exchange reconciliation
//! - Shutdown through the account's cancellation token

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::registry::{AccountContext, AccountRegistry};

/// Shortest schedule period; zero would spin.
const MIN_PERIOD: Duration = Duration::from_secs(1);

fn schedule(period: Duration) -> Interval {
    let mut timer = interval(period.max(MIN_PERIOD));
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

/// What the last health check found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub session_up: bool,
    pub user_stream_restarted: bool,
    pub feeds_started: Vec<String>,
}

/// Drives one account until its token is canceled or a fatal error occurs.
pub struct AccountRunner {
    account: Arc<AccountContext>,
}

impl AccountRunner {
    pub fn new(account: Arc<AccountContext>) -> Self {
        Self { account }
    }

    /// Bring the session, user stream and needed market feeds up.
    ///
    /// Configuration and signing errors are returned; transport and storage
    /// problems are logged and retried on the next check.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let account = &self.account;
        let account_id = account.account_id;
        let mut report = HealthReport::default();

        if let Err(e) = account.session.start().await {
            if e.is_fatal() {
                bail!("Account {} cannot start its session: {}", account_id, e);
            }
            warn!(account_id, error = %e, "Session start failed, retrying at next health check");
            return Ok(report);
        }
        report.session_up = true;

        match account.user.ensure().await {
            Ok(restarted) => report.user_stream_restarted = restarted,
            Err(e) if e.is_fatal() => bail!("Account {} user stream: {}", account_id, e),
            Err(e) => warn!(account_id, error = %e, "User stream unavailable"),
        }

        let symbols = match self.needed_symbols().await {
            Ok(symbols) => symbols,
            Err(e) => {
                warn!(account_id, error = %format!("{:#}", e), "Symbol lookup failed, feeds checked at next health check");
                return Ok(report);
            }
        };

        for symbol in symbols {
            if account.market.ensure(&symbol).await {
                report.feeds_started.push(symbol);
            }
        }

        if report.user_stream_restarted || !report.feeds_started.is_empty() {
            info!(
                account_id,
                user_stream = report.user_stream_restarted,
                feeds = ?report.feeds_started,
                "💓 Health check restored connections"
            );
        } else {
            debug!(account_id, "Health check: all connections live");
        }
        Ok(report)
    }

    /// Symbols with a pending signal, open position or active order.
    async fn needed_symbols(&self) -> Result<BTreeSet<String>> {
        let db = &self.account.engine.db;
        let account_id = self.account.account_id;
        let mut symbols: BTreeSet<String> = db.pending_symbols(account_id).await?.into_iter().collect();
        symbols.extend(db.symbols_in_use(account_id).await?);
        Ok(symbols)
    }

    pub async fn run(&self) -> Result<()> {
        let account = &self.account;
        let account_id = account.account_id;
        let config = &account.engine.config;

        info!(account_id, "🚀 Account runner starting");
        self.health_check().await?;

        let mut health = schedule(config.health_check_interval());
        let mut sweep = schedule(config.unfed_sweep_interval());
        let mut light = schedule(config.archival_interval());
        let mut heavy = schedule(config.heavy_pass_interval());
        // First health tick fires immediately; the startup check covered it
        health.tick().await;

        loop {
            tokio::select! {
                _ = account.cancel.cancelled() => break,
                _ = health.tick() => {
                    self.health_check().await?;
                }
                _ = sweep.tick() => {
                    if let Err(e) = account.evaluator.sweep_unfed(Utc::now(), account.market.as_ref()).await {
                        error!(account_id, error = %e, "Unfed signal sweep failed");
                    }
                }
                _ = light.tick() => {
                    if let Err(e) = account.archival.run_light(Utc::now()).await {
                        error!(account_id, error = %e, "Archival cycle failed");
                    }
                }
                _ = heavy.tick() => {
                    if let Err(e) = account.archival.run_heavy().await {
                        error!(account_id, error = %e, "Exchange reconciliation failed");
                    }
                }
            }
        }

        info!(account_id, "Account runner stopped");
        Ok(())
    }
}

/// Run every account in its own task until Ctrl+C. An account that fails
/// is torn down without touching the others.
pub async fn run_accounts(registry: Arc<AccountRegistry>, account_ids: &[i64]) -> Result<()> {
    let mut tasks = JoinSet::new();

    for &account_id in account_ids {
        match registry.open(account_id).await {
            Ok(account) => {
                tasks.spawn(async move { (account_id, AccountRunner::new(account).run().await) });
            }
            Err(e) => error!(account_id, error = %format!("{:#}", e), "Account failed to start"),
        }
    }

    if tasks.is_empty() {
        bail!("No account could be started");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((account_id, Ok(())))) => info!(account_id, "Account finished"),
                Some(Ok((account_id, Err(e)))) => {
                    error!(account_id, error = %format!("{:#}", e), "Account stopped on error");
                    registry.close(account_id).await;
                }
                Some(Err(e)) => error!(error = %e, "Account task aborted"),
            },
        }
    }

    registry.close_all().await;
    while tasks.join_next().await.is_some() {}
    Ok(())
}
