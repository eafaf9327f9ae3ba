//! Periodic archival and exchange reconciliation.
//!
//! The light cycle is cheap and local: expire stale signals, migrate
//! terminal rows, release unused feeds. The heavy pass compares local
//! state against the exchange and repairs ghosts (positions the exchange
//! no longer has) and orphans (orders the exchange no longer lists).

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{EngineContext, FeedControl, OrderReconciler};
use crate::exchange::OrderUpdate;
use crate::models::{Order, Position, SignalStatus, QTY_EPSILON};

/// What one cycle did. Units that failed are counted and left for the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub expired_signals: usize,
    pub settled_signals: usize,
    pub archived_orders: usize,
    pub archived_positions: usize,
    pub stopped_feeds: usize,
    pub ghost_positions: usize,
    pub orphan_orders: usize,
    pub failed_units: usize,
}

impl CycleReport {
    pub fn merge(&mut self, other: CycleReport) {
        self.expired_signals += other.expired_signals;
        self.settled_signals += other.settled_signals;
        self.archived_orders += other.archived_orders;
        self.archived_positions += other.archived_positions;
        self.stopped_feeds += other.stopped_feeds;
        self.ghost_positions += other.ghost_positions;
        self.orphan_orders += other.orphan_orders;
        self.failed_units += other.failed_units;
    }

    pub fn is_empty(&self) -> bool {
        *self == CycleReport::default()
    }
}

pub struct ArchivalJob {
    ctx: EngineContext,
    reconciler: Arc<OrderReconciler>,
    feeds: Arc<dyn FeedControl>,
}

impl ArchivalJob {
    pub fn new(ctx: EngineContext, reconciler: Arc<OrderReconciler>, feeds: Arc<dyn FeedControl>) -> Self {
        Self {
            ctx,
            reconciler,
            feeds,
        }
    }

    /// Light cycle followed by the heavy pass.
    pub async fn run_full(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = self.run_light(now).await?;
        report.merge(self.run_heavy().await?);
        Ok(report)
    }

    pub async fn run_light(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        report.expired_signals = self.expire_stale_signals(now).await?;
        self.settle_stalled_signals(now, &mut report).await?;
        self.migrate_terminal_rows(&mut report).await?;
        report.stopped_feeds = self.release_idle_feeds().await?;

        if !report.is_empty() {
            info!(
                account_id = self.ctx.account_id,
                expired = report.expired_signals,
                settled = report.settled_signals,
                orders = report.archived_orders,
                positions = report.archived_positions,
                feeds = report.stopped_feeds,
                failed = report.failed_units,
                "🧹 Archival cycle"
            );
        }
        Ok(report)
    }

    pub async fn run_heavy(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.clean_ghost_positions(&mut report).await?;
        self.resolve_orphan_orders(&mut report).await?;

        if report.ghost_positions > 0 || report.orphan_orders > 0 || report.failed_units > 0 {
            info!(
                account_id = self.ctx.account_id,
                ghosts = report.ghost_positions,
                orphans = report.orphan_orders,
                failed = report.failed_units,
                "🔍 Exchange reconciliation"
            );
        }
        Ok(report)
    }

    async fn expire_stale_signals(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;

        for signal in self.ctx.db.all_pending_signals(self.ctx.account_id).await? {
            if !signal.is_expired(now) {
                continue;
            }
            if self
                .ctx
                .db
                .cancel_pending_signal(signal.id, &signal.expiry_reason())
                .await?
            {
                debug!(account_id = self.ctx.account_id, signal_id = signal.id, symbol = %signal.symbol, "Stale signal expired");
                expired += 1;
            }
        }

        Ok(expired)
    }

    /// Settle signals stuck in PROCESSING past the processing timeout:
    /// COMPLETED when an entry order was recorded for them, ERROR otherwise.
    async fn settle_stalled_signals(&self, now: DateTime<Utc>, report: &mut CycleReport) -> Result<()> {
        let db = &self.ctx.db;
        let timeout = self.ctx.config.processing_timeout_secs;
        let cutoff = now - chrono::Duration::seconds(timeout.min(u64::from(u32::MAX)) as i64);

        for signal in db.stale_processing_signals(self.ctx.account_id, cutoff).await? {
            let settled = match db.signal_has_entry(signal.id).await {
                Ok(true) => {
                    db.settle_processing_signal(
                        signal.id,
                        SignalStatus::Completed,
                        "Processing stalled after the entry order was recorded",
                    )
                    .await
                }
                Ok(false) => {
                    db.settle_processing_signal(
                        signal.id,
                        SignalStatus::Error,
                        &format!("Processing stalled for over {}s before any entry order", timeout),
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match settled {
                Ok(true) => {
                    warn!(account_id = self.ctx.account_id, signal_id = signal.id, symbol = %signal.symbol, "Stalled signal settled");
                    report.settled_signals += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(account_id = self.ctx.account_id, signal_id = signal.id, error = %e, "Stalled signal not settled");
                    report.failed_units += 1;
                }
            }
        }

        Ok(())
    }

    async fn migrate_terminal_rows(&self, report: &mut CycleReport) -> Result<()> {
        let db = &self.ctx.db;

        for order in db.terminal_orders(self.ctx.account_id).await? {
            match db.archive_order(order.id).await {
                Ok(true) => report.archived_orders += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(account_id = self.ctx.account_id, order_id = %order.external_id, error = %e, "Order archival failed");
                    report.failed_units += 1;
                }
            }
        }

        for position in db.closed_live_positions(self.ctx.account_id).await? {
            match db.archive_position(position.id).await {
                Ok(true) => report.archived_positions += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(account_id = self.ctx.account_id, position_id = position.id, error = %e, "Position archival failed");
                    report.failed_units += 1;
                }
            }
        }

        Ok(())
    }

    /// Stop feeds for symbols with no pending signal, open position or open order.
    async fn release_idle_feeds(&self) -> Result<usize> {
        let subscribed = self.feeds.subscribed_symbols().await;
        if subscribed.is_empty() {
            return Ok(0);
        }

        let db = &self.ctx.db;
        let mut needed: HashSet<String> = db.pending_symbols(self.ctx.account_id).await?.into_iter().collect();
        needed.extend(db.symbols_in_use(self.ctx.account_id).await?);

        match self.ctx.exchange.open_orders(None).await {
            Ok(open) => needed.extend(open.into_iter().map(|o| o.symbol)),
            Err(e) => {
                // Without the exchange view we cannot tell which feeds are idle
                warn!(account_id = self.ctx.account_id, error = %e, "Open orders unavailable, keeping feeds");
                return Ok(0);
            }
        }

        let mut stopped = 0;
        for symbol in subscribed.iter().filter(|s| !needed.contains(*s)) {
            self.feeds.stop(symbol).await;
            debug!(account_id = self.ctx.account_id, symbol = %symbol, "Idle feed stopped");
            stopped += 1;
        }

        Ok(stopped)
    }

    async fn clean_ghost_positions(&self, report: &mut CycleReport) -> Result<()> {
        let positions = self.ctx.db.open_positions(self.ctx.account_id).await?;
        if positions.is_empty() {
            return Ok(());
        }

        let live: HashSet<String> = match self.ctx.exchange.positions().await {
            Ok(exchange_positions) => exchange_positions
                .into_iter()
                .filter(|p| p.position_amt.abs() > QTY_EPSILON)
                .map(|p| p.symbol)
                .collect(),
            Err(e) => {
                warn!(account_id = self.ctx.account_id, error = %e, "Exchange positions unavailable, ghost check skipped");
                return Ok(());
            }
        };

        for position in positions.iter().filter(|p| !live.contains(&p.symbol)) {
            match self.archive_ghost(position).await {
                Ok(()) => report.ghost_positions += 1,
                Err(e) => {
                    warn!(
                        account_id = self.ctx.account_id,
                        position_id = position.id,
                        symbol = %position.symbol,
                        error = %e,
                        "Ghost position cleanup failed"
                    );
                    report.failed_units += 1;
                }
            }
        }

        Ok(())
    }

    async fn archive_ghost(&self, position: &Position) -> Result<()> {
        let db = &self.ctx.db;
        let exchange = &self.ctx.exchange;
        let account_id = self.ctx.account_id;

        info!(
            account_id,
            position_id = position.id,
            symbol = %position.symbol,
            side = %position.side,
            quantity = position.quantity,
            "👻 Position gone on exchange, archiving"
        );

        let leftovers = exchange
            .open_orders(Some(&position.symbol))
            .await
            .with_context(|| format!("Failed to list open orders for {}", position.symbol))?;
        for order in leftovers {
            if let Err(e) = exchange.cancel_order(&position.symbol, &order.order_id).await {
                warn!(account_id, order_id = %order.order_id, error = %e, "Leftover order cancel failed");
            }
            tokio::time::sleep(self.ctx.config.inter_call_delay()).await;
        }

        for order in db.active_orders_for_symbol(account_id, &position.symbol).await? {
            db.mark_order_canceled(order.id).await?;
            if order.position_id.is_none() {
                db.set_order_position(order.id, position.id).await?;
            }
        }

        db.archive_position(position.id).await?;

        self.ctx.notifier.notify(
            account_id,
            format!(
                "👻 {} {} {} closed outside the bot, archived",
                position.symbol, position.side, position.quantity
            ),
        );
        Ok(())
    }

    async fn resolve_orphan_orders(&self, report: &mut CycleReport) -> Result<()> {
        // Local snapshot first: anything placed after it is not a candidate
        let local = self.ctx.db.active_orders(self.ctx.account_id).await?;
        if local.is_empty() {
            return Ok(());
        }

        let listed: HashSet<String> = match self.ctx.exchange.open_orders(None).await {
            Ok(open) => open.into_iter().map(|o| o.order_id).collect(),
            Err(e) => {
                warn!(account_id = self.ctx.account_id, error = %e, "Open orders unavailable, orphan check skipped");
                return Ok(());
            }
        };

        for order in local.iter().filter(|o| !listed.contains(&o.external_id)) {
            match self.resolve_orphan(order).await {
                Ok(true) => report.orphan_orders += 1,
                Ok(false) => report.failed_units += 1,
                Err(e) => {
                    warn!(account_id = self.ctx.account_id, order_id = %order.external_id, error = %e, "Orphan order resolution failed");
                    report.failed_units += 1;
                }
            }
        }

        Ok(())
    }

    /// False when the exchange could not tell us what happened.
    async fn resolve_orphan(&self, order: &Order) -> Result<bool> {
        let account_id = self.ctx.account_id;

        match self.ctx.exchange.order_status(&order.symbol, &order.external_id).await {
            Ok(snapshot) => match OrderUpdate::from_exchange_order(account_id, &snapshot) {
                Some(update) => {
                    debug!(account_id, order_id = %order.external_id, status = %snapshot.status, "Orphan order polled");
                    self.reconciler.handle_order_update(update).await?;
                    Ok(true)
                }
                None => {
                    warn!(account_id, order_id = %order.external_id, status = %snapshot.status, "Unrecognized order snapshot");
                    Ok(false)
                }
            },
            Err(e) if e.is_order_not_found() => {
                info!(account_id, order_id = %order.external_id, symbol = %order.symbol, "Order unknown to exchange, marking canceled");
                self.ctx.db.mark_order_canceled(order.id).await?;
                self.ctx.db.archive_order(order.id).await?;
                Ok(true)
            }
            Err(e) => {
                warn!(account_id, order_id = %order.external_id, error = %e, "Order status unavailable");
                Ok(false)
            }
        }
    }
}
