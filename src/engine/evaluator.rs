//! Signal trigger evaluation.
//!
//! On every price tick the PENDING signals of the symbol are checked oldest
//! first: timeout, then stop-before-entry, then the entry trigger. A fired
//! signal places a MARKET entry plus close-position stop-loss and
//! take-profit orders.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{EngineContext, FeedControl, OrderReconciler};
use crate::exchange::{ExchangeOrder, OrderRequest, PriceUpdate};
use crate::feeds::PriceListener;
use crate::models::{
    new_client_order_id, BotRole, NewOrder, OrderStatus, Signal, SignalStatus, TrailingLevel,
    CLIENT_ID_ENTRY, CLIENT_ID_STOP_LOSS, CLIENT_ID_TAKE_PROFIT,
};

pub struct SignalEvaluator {
    ctx: EngineContext,
    reconciler: Arc<OrderReconciler>,
    // Signal ids with an entry in flight
    processing: StdMutex<HashSet<i64>>,
    symbol_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SignalEvaluator {
    pub fn new(ctx: EngineContext, reconciler: Arc<OrderReconciler>) -> Self {
        Self {
            ctx,
            reconciler,
            processing: StdMutex::new(HashSet::new()),
            symbol_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .symbol_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the symbol's lock once nobody but the map and `held` refer to it.
    fn release_symbol_lock(&self, symbol: &str, held: Arc<Mutex<()>>) {
        let mut locks = self
            .symbol_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if Arc::strong_count(&held) == 2 {
            locks.remove(symbol);
        }
    }

    /// Evaluate a tick. Skipped when an evaluation for the symbol is running.
    pub async fn evaluate(&self, symbol: &str, price: f64) -> Result<()> {
        let lock = self.symbol_lock(symbol);
        let result = match lock.try_lock() {
            Ok(_running) => self.evaluate_at(symbol, price, Utc::now()).await,
            Err(_) => {
                debug!(account_id = self.ctx.account_id, symbol, price, "Evaluation in progress, tick skipped");
                Ok(())
            }
        };
        self.release_symbol_lock(symbol, lock);
        result
    }

    pub async fn evaluate_at(&self, symbol: &str, price: f64, now: DateTime<Utc>) -> Result<()> {
        let signals = self.ctx.db.pending_signals(self.ctx.account_id, symbol).await?;

        for signal in signals {
            if signal.is_expired(now) {
                self.cancel(&signal, &signal.expiry_reason()).await?;
                continue;
            }

            if signal.stop_breached(price) {
                let reason = format!(
                    "Stop loss {} breached at {} before entry {}",
                    signal.stop_loss, price, signal.entry_price
                );
                self.cancel(&signal, &reason).await?;
                continue;
            }

            if signal.entry_triggered(price) {
                self.trigger(&signal, price).await?;
            }
        }

        Ok(())
    }

    /// Expire PENDING signals on symbols without a live price feed; nothing
    /// else would ever evaluate them.
    pub async fn sweep_unfed(&self, now: DateTime<Utc>, feeds: &dyn FeedControl) -> Result<usize> {
        let mut expired = 0;

        for signal in self.ctx.db.all_pending_signals(self.ctx.account_id).await? {
            if !signal.is_expired(now) || feeds.has_live_feed(&signal.symbol).await {
                continue;
            }
            if self.cancel(&signal, &signal.expiry_reason()).await? {
                expired += 1;
            }
        }

        if expired > 0 {
            info!(account_id = self.ctx.account_id, expired, "Expired signals without a price feed");
        }
        Ok(expired)
    }

    async fn cancel(&self, signal: &Signal, reason: &str) -> Result<bool> {
        let canceled = self.ctx.db.cancel_pending_signal(signal.id, reason).await?;
        if canceled {
            info!(
                account_id = self.ctx.account_id,
                signal_id = signal.id,
                symbol = %signal.symbol,
                reason,
                "Signal canceled"
            );
        }
        Ok(canceled)
    }

    async fn trigger(&self, signal: &Signal, price: f64) -> Result<()> {
        {
            let mut processing = self
                .processing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !processing.insert(signal.id) {
                debug!(account_id = self.ctx.account_id, signal_id = signal.id, "Signal already in flight");
                return Ok(());
            }
        }

        let result = self.execute(signal, price).await;

        self.processing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&signal.id);

        result
    }

    async fn execute(&self, signal: &Signal, price: f64) -> Result<()> {
        let account_id = self.ctx.account_id;

        if !self.ctx.db.claim_signal(signal.id).await? {
            debug!(account_id, signal_id = signal.id, "Signal claimed elsewhere");
            return Ok(());
        }

        info!(
            account_id,
            signal_id = signal.id,
            symbol = %signal.symbol,
            side = %signal.side,
            entry = signal.entry_price,
            price,
            "🎯 Signal triggered"
        );

        // A claimed signal must leave PROCESSING whatever happens below
        let mut entry_placed = false;
        let result = self.run_claimed(signal, price, &mut entry_placed).await;
        if let Err(e) = &result {
            self.settle_after_failure(signal, entry_placed, e).await;
        }
        result
    }

    async fn settle_after_failure(&self, signal: &Signal, entry_placed: bool, cause: &anyhow::Error) {
        let account_id = self.ctx.account_id;
        let (status, reason) = if entry_placed {
            (
                SignalStatus::Completed,
                format!("Entry placed but bookkeeping failed: {:#}", cause),
            )
        } else {
            (SignalStatus::Error, format!("Processing failed: {:#}", cause))
        };

        match self.ctx.db.settle_processing_signal(signal.id, status, &reason).await {
            Ok(_) => error!(
                account_id,
                signal_id = signal.id,
                status = status.as_str(),
                reason = %reason,
                "Signal settled after failure"
            ),
            Err(e) => error!(
                account_id,
                signal_id = signal.id,
                error = %e,
                "Signal left PROCESSING; the archival cycle will settle it"
            ),
        }
        self.ctx.notifier.notify(
            account_id,
            format!("❌ Signal {} on {}: {}", signal.id, signal.symbol, reason),
        );
    }

    async fn run_claimed(&self, signal: &Signal, price: f64, entry_placed: &mut bool) -> Result<()> {
        let db = &self.ctx.db;
        let exchange = &self.ctx.exchange;
        let account_id = self.ctx.account_id;

        if let Some(existing) = db.find_open_position(account_id, &signal.symbol).await? {
            let reason = format!(
                "Open {} position {} already exists for {}",
                existing.side, existing.id, signal.symbol
            );
            return self.fail(signal, &reason).await;
        }

        let quantity = match signal.quantity.filter(|q| *q > 0.0) {
            Some(q) => q,
            None => self.ctx.config.default_notional / price,
        };

        if let Err(e) = exchange.set_leverage(&signal.symbol, signal.leverage).await {
            return self
                .fail(signal, &format!("Setting leverage {}x failed: {}", signal.leverage, e))
                .await;
        }

        let entry_req = OrderRequest::market(
            &signal.symbol,
            signal.side,
            quantity,
            new_client_order_id(CLIENT_ID_ENTRY),
        );
        let entry = match exchange.place_order(entry_req.clone()).await {
            Ok(order) => order,
            Err(e) => return self.fail(signal, &format!("Entry order failed: {}", e)).await,
        };
        *entry_placed = true;

        self.reconciler
            .record_placement(
                order_row(account_id, &entry, &entry_req, BotRole::Entry, None, signal.id),
                &entry,
            )
            .await?;

        let closing = signal.side.opposite();
        let protective = [
            (
                OrderRequest::stop_loss(
                    &signal.symbol,
                    closing,
                    signal.stop_loss,
                    new_client_order_id(CLIENT_ID_STOP_LOSS),
                ),
                BotRole::StopLoss,
                Some(TrailingLevel::Original),
            ),
            (
                OrderRequest::take_profit(
                    &signal.symbol,
                    closing,
                    signal.final_target(),
                    new_client_order_id(CLIENT_ID_TAKE_PROFIT),
                ),
                BotRole::TakeProfit,
                None,
            ),
        ];

        let mut failures = Vec::new();
        for (req, role, level) in protective {
            tokio::time::sleep(self.ctx.config.inter_call_delay()).await;
            match exchange.place_order(req.clone()).await {
                Ok(placed) => {
                    self.reconciler
                        .record_placement(order_row(account_id, &placed, &req, role, level, signal.id), &placed)
                        .await?;
                }
                Err(e) => {
                    error!(
                        account_id,
                        signal_id = signal.id,
                        role = role.as_str(),
                        error = %e,
                        "Protective order failed"
                    );
                    failures.push(format!("{} at {} failed: {}", role.as_str(), req.stop_price_f64(), e));
                }
            }
        }

        // The fill may have been booked by the stream before our rows existed
        if let Some(position) = db.find_open_position(account_id, &signal.symbol).await? {
            db.link_protective_orders(account_id, &signal.symbol, position.id).await?;
            db.attach_position_signal(position.id, signal.id).await?;
            db.link_signal_position(signal.id, position.id).await?;
        }

        let message = (!failures.is_empty()).then(|| failures.join("; "));
        db.finish_signal(signal.id, SignalStatus::Completed, message.as_deref())
            .await?;

        match message {
            Some(msg) => {
                warn!(account_id, signal_id = signal.id, failures = %msg, "Entry placed with incomplete protection");
                self.ctx.notifier.notify(
                    account_id,
                    format!(
                        "⚠️ {} {} entered but protection incomplete: {}",
                        signal.symbol, signal.side, msg
                    ),
                );
            }
            None => {
                info!(account_id, signal_id = signal.id, order_id = %entry.order_id, "✅ Signal completed");
                self.ctx.notifier.notify(
                    account_id,
                    format!(
                        "{} {} {} entered near {}, SL {}, TP {}",
                        signal.symbol,
                        signal.side,
                        entry_req.quantity_f64(),
                        price,
                        signal.stop_loss,
                        signal.final_target()
                    ),
                );
            }
        }

        Ok(())
    }

    async fn fail(&self, signal: &Signal, reason: &str) -> Result<()> {
        error!(
            account_id = self.ctx.account_id,
            signal_id = signal.id,
            symbol = %signal.symbol,
            reason,
            "Signal failed"
        );
        self.ctx
            .db
            .finish_signal(signal.id, SignalStatus::Error, Some(reason))
            .await?;
        self.ctx.notifier.notify(
            self.ctx.account_id,
            format!("❌ Signal {} on {} failed: {}", signal.id, signal.symbol, reason),
        );
        Ok(())
    }
}

/// Local row for an order we just placed. Status starts NEW; the placement
/// result is applied on top by the reconciler.
fn order_row(
    account_id: i64,
    placed: &ExchangeOrder,
    req: &OrderRequest,
    role: BotRole,
    level: Option<TrailingLevel>,
    signal_id: i64,
) -> NewOrder {
    NewOrder {
        account_id,
        external_id: placed.order_id.clone(),
        client_order_id: req.client_order_id.clone(),
        symbol: req.symbol.clone(),
        side: req.side,
        order_type: req.order_type,
        price: placed.price,
        stop_price: if placed.stop_price > 0.0 {
            placed.stop_price
        } else {
            req.stop_price_f64()
        },
        quantity: placed.orig_qty.max(req.quantity_f64()),
        executed_qty: 0.0,
        avg_price: 0.0,
        status: OrderStatus::New,
        bot_role: role,
        reduce_only: req.reduce_only,
        close_position: req.close_position,
        position_id: None,
        trailing_level: level,
        signal_id: Some(signal_id),
    }
}

#[async_trait]
impl PriceListener for SignalEvaluator {
    async fn on_price(&self, update: PriceUpdate) {
        if let Err(e) = self.evaluate(&update.symbol, update.price).await {
            error!(
                account_id = self.ctx.account_id,
                symbol = %update.symbol,
                error = %e,
                "Signal evaluation failed"
            );
        }
    }
}
