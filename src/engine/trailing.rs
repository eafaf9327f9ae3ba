//! Trailing stop ratchet.
//!
//! ORIGINAL -> BREAKEVEN once price reaches target 1 (stop moves to entry),
//! BREAKEVEN -> TP1 once price reaches the final target (stop moves to
//! target 1). The level is persisted before the stop is replaced and never
//! moves back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{EngineContext, OrderReconciler};
use crate::exchange::{OrderRequest, PriceUpdate};
use crate::feeds::PriceListener;
use crate::models::{
    new_client_order_id, BotRole, NewOrder, OrderStatus, Position, Signal, TrailingLevel,
    CLIENT_ID_STOP_LOSS,
};

pub struct TrailingStopEngine {
    ctx: EngineContext,
    reconciler: Arc<OrderReconciler>,
    // Keyed by symbol: at most one open position per symbol and account
    last_evaluated: StdMutex<HashMap<String, Instant>>,
}

impl TrailingStopEngine {
    pub fn new(ctx: EngineContext, reconciler: Arc<OrderReconciler>) -> Self {
        Self {
            ctx,
            reconciler,
            last_evaluated: StdMutex::new(HashMap::new()),
        }
    }

    /// Rate limiter: true if the symbol may be evaluated now. Entries older
    /// than the interval are dropped on the way.
    fn admit(&self, symbol: &str) -> bool {
        let interval = self.ctx.config.trailing_interval();
        let mut last = self
            .last_evaluated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();

        last.retain(|_, at| now.duration_since(*at) < interval);
        if last.contains_key(symbol) {
            return false;
        }
        if !interval.is_zero() {
            last.insert(symbol.to_string(), now);
        }
        true
    }

    #[cfg(test)]
    fn tracked_symbols(&self) -> usize {
        self.last_evaluated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub async fn evaluate(&self, symbol: &str, price: f64) -> Result<()> {
        if !self.admit(symbol) {
            return Ok(());
        }
        let Some(position) = self.ctx.db.find_open_position(self.ctx.account_id, symbol).await? else {
            return Ok(());
        };

        self.ctx
            .db
            .update_position_price(self.ctx.account_id, symbol, price)
            .await?;

        // Targets live on the origin signal; without one there is nothing to trail
        let Some(signal_id) = position.signal_id else {
            return Ok(());
        };
        let Some(signal) = self.ctx.db.get_signal(signal_id).await? else {
            return Ok(());
        };

        let side = position.side;
        let advance = match position.trailing_level {
            TrailingLevel::Original if side.reached(price, signal.take_profit1) => Some(TrailingLevel::Breakeven),
            TrailingLevel::Breakeven if side.reached(price, signal.final_target()) => Some(TrailingLevel::Tp1),
            _ => None,
        };

        match advance {
            Some(level) => self.advance(&position, &signal, level, price).await,
            None => self.repair(&position, &signal).await,
        }
    }

    async fn advance(&self, position: &Position, signal: &Signal, level: TrailingLevel, price: f64) -> Result<()> {
        if !self
            .ctx
            .db
            .advance_trailing_level(position.id, position.trailing_level, level)
            .await?
        {
            debug!(account_id = self.ctx.account_id, position_id = position.id, "Trailing level moved concurrently");
            return Ok(());
        }

        info!(
            account_id = self.ctx.account_id,
            symbol = %position.symbol,
            position_id = position.id,
            from = position.trailing_level.as_str(),
            to = level.as_str(),
            price,
            "📈 Trailing level advanced"
        );

        self.replace_stop(position, level, stop_for(position, signal, level)).await
    }

    /// Re-place a missing stop for a level that was persisted earlier.
    async fn repair(&self, position: &Position, signal: &Signal) -> Result<()> {
        let level = position.trailing_level;
        if level == TrailingLevel::Original {
            return Ok(());
        }
        if self.ctx.db.active_stop_for_level(position.id, level).await?.is_some() {
            return Ok(());
        }

        warn!(
            account_id = self.ctx.account_id,
            position_id = position.id,
            level = level.as_str(),
            "No active stop for trailing level, re-placing"
        );
        self.replace_stop(position, level, stop_for(position, signal, level)).await
    }

    /// Cancel the closing-side stops for the symbol, let the cancels settle,
    /// then place and record the stop for `level`.
    async fn replace_stop(&self, position: &Position, level: TrailingLevel, stop_price: f64) -> Result<()> {
        let db = &self.ctx.db;
        let exchange = &self.ctx.exchange;
        let account_id = self.ctx.account_id;
        let closing = position.side.opposite();

        let local_stops: Vec<_> = db
            .active_orders_for_symbol(account_id, &position.symbol)
            .await?
            .into_iter()
            .filter(|o| o.bot_role == BotRole::StopLoss && o.side == closing)
            .collect();

        let mut targets: Vec<String> = match exchange.open_orders(Some(&position.symbol)).await {
            Ok(open) => open
                .into_iter()
                .filter(|o| o.side == closing && o.order_type().map_or(false, |t| t.is_stop()))
                .map(|o| o.order_id)
                .collect(),
            Err(e) => {
                warn!(account_id, symbol = %position.symbol, error = %e, "Open orders unavailable, canceling known stops");
                Vec::new()
            }
        };
        for order in &local_stops {
            if !targets.contains(&order.external_id) {
                targets.push(order.external_id.clone());
            }
        }

        let mut released = HashSet::new();
        for external_id in &targets {
            match exchange.cancel_order(&position.symbol, external_id).await {
                Ok(outcome) => {
                    debug!(account_id, order_id = %external_id, outcome = ?outcome, "Stop canceled");
                    released.insert(external_id.clone());
                }
                Err(e) => warn!(account_id, order_id = %external_id, error = %e, "Stop cancel failed"),
            }
            tokio::time::sleep(self.ctx.config.inter_call_delay()).await;
        }

        for order in local_stops.iter().filter(|o| released.contains(&o.external_id)) {
            db.mark_order_canceled(order.id).await?;
        }

        tokio::time::sleep(self.ctx.config.settle_delay()).await;

        let req = OrderRequest::stop_loss(
            &position.symbol,
            closing,
            stop_price,
            new_client_order_id(CLIENT_ID_STOP_LOSS),
        );

        match exchange.place_order(req.clone()).await {
            Ok(placed) => {
                let row = NewOrder {
                    account_id,
                    external_id: placed.order_id.clone(),
                    client_order_id: req.client_order_id.clone(),
                    symbol: position.symbol.clone(),
                    side: closing,
                    order_type: req.order_type,
                    price: 0.0,
                    stop_price: req.stop_price_f64(),
                    quantity: 0.0,
                    executed_qty: 0.0,
                    avg_price: 0.0,
                    status: OrderStatus::New,
                    bot_role: BotRole::StopLoss,
                    reduce_only: false,
                    close_position: true,
                    position_id: Some(position.id),
                    trailing_level: Some(level),
                    signal_id: position.signal_id,
                };
                self.reconciler.record_placement(row, &placed).await?;

                info!(
                    account_id,
                    position_id = position.id,
                    level = level.as_str(),
                    stop_price = req.stop_price_f64(),
                    canceled = released.len(),
                    "Stop loss moved"
                );
                self.ctx.notifier.notify(
                    account_id,
                    format!(
                        "🔒 {} {} stop moved to {} ({})",
                        position.symbol,
                        position.side,
                        req.stop_price_f64(),
                        level.as_str()
                    ),
                );
            }
            Err(e) => {
                error!(
                    account_id,
                    position_id = position.id,
                    level = level.as_str(),
                    error = %e,
                    "Stop replacement failed, position unprotected until next evaluation"
                );
                self.ctx.notifier.notify(
                    account_id,
                    format!(
                        "🚨 {} {} has no stop: placing {} at {} failed: {}",
                        position.symbol,
                        position.side,
                        level.as_str(),
                        stop_price,
                        e
                    ),
                );
            }
        }

        Ok(())
    }
}

fn stop_for(position: &Position, signal: &Signal, level: TrailingLevel) -> f64 {
    match level {
        TrailingLevel::Original => signal.stop_loss,
        TrailingLevel::Breakeven => position.entry_price,
        TrailingLevel::Tp1 => signal.take_profit1,
    }
}

#[async_trait]
impl PriceListener for TrailingStopEngine {
    async fn on_price(&self, update: PriceUpdate) {
        if let Err(e) = self.evaluate(&update.symbol, update.price).await {
            error!(
                account_id = self.ctx.account_id,
                symbol = %update.symbol,
                error = %e,
                "Trailing evaluation failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{harness, Harness};
    use crate::exchange::fake::exchange_order;
    use crate::models::{NewPosition, NewSignal, OrderType, Side};
    use chrono::Utc;

    /// BUY position at 100 with targets 105/110/115 and a resting stop at 95.
    async fn protected_position(h: &Harness) -> i64 {
        let db = &h.ctx.db;
        let signal_id = db
            .insert_signal(
                &NewSignal {
                    account_id: 1,
                    symbol: "BTCUSDT".to_string(),
                    side: Side::Buy,
                    entry_price: 100.0,
                    stop_loss: 95.0,
                    take_profit1: 105.0,
                    take_profit2: Some(110.0),
                    take_profit3: Some(115.0),
                    quantity: Some(1.0),
                    leverage: 10,
                    timeframe: None,
                    expires_at: None,
                    max_lifetime_secs: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let position_id = db
            .open_position(&NewPosition {
                account_id: 1,
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                quantity: 1.0,
                entry_price: 100.0,
                leverage: 10,
                signal_id: Some(signal_id),
            })
            .await
            .unwrap()
            .unwrap();

        let mut resting = exchange_order("500", "BTCUSDT", Side::Sell, OrderType::StopMarket, OrderStatus::New);
        resting.stop_price = 95.0;
        resting.close_position = true;
        h.exchange.insert_order(resting);

        db.insert_order(&NewOrder {
            account_id: 1,
            external_id: "500".to_string(),
            client_order_id: "pm-sl-500".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            order_type: OrderType::StopMarket,
            price: 0.0,
            stop_price: 95.0,
            quantity: 0.0,
            executed_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::New,
            bot_role: BotRole::StopLoss,
            reduce_only: false,
            close_position: true,
            position_id: Some(position_id),
            trailing_level: Some(TrailingLevel::Original),
            signal_id: Some(signal_id),
        })
        .await
        .unwrap();

        position_id
    }

    fn engine(h: &Harness) -> TrailingStopEngine {
        TrailingStopEngine::new(h.ctx.clone(), Arc::new(OrderReconciler::new(h.ctx.clone())))
    }

    fn stops_placed(h: &Harness) -> Vec<f64> {
        h.exchange
            .placed()
            .iter()
            .filter(|r| r.order_type == OrderType::StopMarket)
            .map(|r| r.stop_price_f64())
            .collect()
    }

    #[tokio::test]
    async fn test_scenario_c_moves_stop_to_breakeven() {
        let h = harness().await;
        let position_id = protected_position(&h).await;
        let trailing = engine(&h);

        trailing.evaluate("BTCUSDT", 106.0).await.unwrap();

        let position = h.ctx.db.get_position(position_id).await.unwrap().unwrap();
        assert_eq!(position.trailing_level, TrailingLevel::Breakeven);
        assert_eq!(position.current_price, 106.0);
        assert_eq!(h.exchange.canceled(), vec!["500".to_string()]);
        assert_eq!(stops_placed(&h), vec![100.0]);

        let old = h.ctx.db.find_order(1, "BTCUSDT", "500").await.unwrap().unwrap();
        assert_eq!(old.status, OrderStatus::Canceled);
        let new = h
            .ctx
            .db
            .active_stop_for_level(position_id, TrailingLevel::Breakeven)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(new.stop_price, 100.0);
        assert_eq!(new.side, Side::Sell);
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_level_never_decreases() {
        let h = harness().await;
        let position_id = protected_position(&h).await;
        let trailing = engine(&h);

        let mut levels = Vec::new();
        for price in [106.0, 104.0, 116.0, 100.0, 90.0] {
            trailing.evaluate("BTCUSDT", price).await.unwrap();
            levels.push(h.ctx.db.get_position(position_id).await.unwrap().unwrap().trailing_level);
        }

        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*levels.last().unwrap(), TrailingLevel::Tp1);
        assert_eq!(stops_placed(&h), vec![100.0, 105.0]);

        let active = h
            .ctx
            .db
            .active_stop_for_level(position_id, TrailingLevel::Tp1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.stop_price, 105.0);
        assert!(h
            .ctx
            .db
            .active_stop_for_level(position_id, TrailingLevel::Breakeven)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_replacement_is_repaired_later() {
        let h = harness().await;
        let position_id = protected_position(&h).await;
        let trailing = engine(&h);
        h.exchange.fail_orders_of_type(OrderType::StopMarket);

        trailing.evaluate("BTCUSDT", 106.0).await.unwrap();

        let position = h.ctx.db.get_position(position_id).await.unwrap().unwrap();
        assert_eq!(position.trailing_level, TrailingLevel::Breakeven);
        assert!(h
            .notifier
            .messages()
            .iter()
            .any(|(_, m)| m.contains("has no stop")));

        h.exchange.clear_failures();
        trailing.evaluate("BTCUSDT", 104.0).await.unwrap();

        let stop = h
            .ctx
            .db
            .active_stop_for_level(position_id, TrailingLevel::Breakeven)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stop.stop_price, 100.0);

        // Stop present: nothing more to do
        trailing.evaluate("BTCUSDT", 104.0).await.unwrap();
        assert_eq!(stops_placed(&h).len(), 2);
    }

    #[tokio::test]
    async fn test_position_without_signal_is_left_alone() {
        let h = harness().await;
        h.ctx
            .db
            .open_position(&NewPosition {
                account_id: 1,
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                quantity: 1.0,
                entry_price: 100.0,
                leverage: 1,
                signal_id: None,
            })
            .await
            .unwrap();
        let trailing = engine(&h);

        trailing.evaluate("BTCUSDT", 500.0).await.unwrap();

        assert!(h.exchange.placed().is_empty());
        let position = h.ctx.db.find_open_position(1, "BTCUSDT").await.unwrap().unwrap();
        assert_eq!(position.trailing_level, TrailingLevel::Original);
    }

    #[tokio::test]
    async fn test_rate_limit_checked_before_storage() {
        let mut h = harness().await;
        h.ctx.config.trailing_interval_secs = 10;
        let trailing = engine(&h);

        trailing.evaluate("BTCUSDT", 100.0).await.unwrap();
        // Within the interval the tick never reaches the database
        h.ctx.db.execute_raw("ALTER TABLE positions RENAME TO positions_moved").await.unwrap();
        trailing.evaluate("BTCUSDT", 101.0).await.unwrap();
        assert!(trailing.evaluate("ETHUSDT", 10.0).await.is_err());
    }

    #[tokio::test]
    async fn test_rate_limiter_forgets_old_symbols() {
        let mut h = harness().await;
        h.ctx.config.trailing_interval_secs = 0;
        let trailing = engine(&h);

        for symbol in ["BTCUSDT", "ETHUSDT", "SOLUSDT"] {
            trailing.evaluate(symbol, 1.0).await.unwrap();
        }
        assert_eq!(trailing.tracked_symbols(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_per_position() {
        let mut h = harness().await;
        h.ctx.config.trailing_interval_secs = 10;
        let position_id = protected_position(&h).await;
        let trailing = engine(&h);

        trailing.evaluate("BTCUSDT", 101.0).await.unwrap();
        trailing.evaluate("BTCUSDT", 106.0).await.unwrap();

        let position = h.ctx.db.get_position(position_id).await.unwrap().unwrap();
        assert_eq!(position.trailing_level, TrailingLevel::Original);
        assert!(h.exchange.placed().is_empty());
    }
}
