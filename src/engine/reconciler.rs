//! Order lifecycle reconciliation.
//!
//! Every order state change, whether it arrives on the private stream, as a
//! placement result or from the archival job's polling, goes through
//! [`OrderReconciler::handle_order_update`]. Updates are applied one at a
//! time per account.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::EngineContext;
use crate::exchange::{ExchangeOrder, OrderUpdate};
use crate::feeds::OrderUpdateListener;
use crate::models::{
    infer_role, BotRole, FillEffect, NewOrder, NewPosition, Order, OrderStatus, Position, PositionStatus,
    Side, QTY_EPSILON,
};

pub struct OrderReconciler {
    ctx: EngineContext,
    serial: Mutex<()>,
}

impl OrderReconciler {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            serial: Mutex::new(()),
        }
    }

    /// Apply one order update: record unknown orders, move the status
    /// forward, book fills against the position, retire terminal orders.
    pub async fn handle_order_update(&self, update: OrderUpdate) -> Result<()> {
        let _serial = self.serial.lock().await;
        self.apply_update(update).await
    }

    /// Record an order this engine just placed, then apply the placement
    /// result. The private stream may have reported the order first; it is
    /// then left as the stream recorded it.
    pub async fn record_placement(&self, order: NewOrder, placed: &ExchangeOrder) -> Result<()> {
        let _serial = self.serial.lock().await;
        let db = &self.ctx.db;

        let existing = db
            .find_order(self.ctx.account_id, &order.symbol, &order.external_id)
            .await?;

        if let Some(row) = existing {
            debug!(
                account_id = self.ctx.account_id,
                order_id = %order.external_id,
                "Placed order already reported by stream"
            );
            db.adopt_order(row.id, order.position_id, order.trailing_level, order.signal_id)
                .await?;
        } else if db
            .is_order_archived(self.ctx.account_id, &order.symbol, &order.external_id)
            .await?
        {
            debug!(
                account_id = self.ctx.account_id,
                order_id = %order.external_id,
                "Placed order already retired"
            );
        } else {
            db.insert_order(&order).await?;
        }

        match OrderUpdate::from_exchange_order(self.ctx.account_id, placed) {
            Some(update) => self.apply_update(update).await,
            None => {
                warn!(
                    account_id = self.ctx.account_id,
                    order_id = %placed.order_id,
                    status = %placed.status,
                    "Unrecognized placement result"
                );
                Ok(())
            }
        }
    }

    async fn apply_update(&self, update: OrderUpdate) -> Result<()> {
        let db = &self.ctx.db;

        let order = match db
            .find_order(self.ctx.account_id, &update.symbol, &update.external_id)
            .await?
        {
            Some(order) => order,
            None => {
                if db
                    .is_order_archived(self.ctx.account_id, &update.symbol, &update.external_id)
                    .await?
                {
                    debug!(
                        account_id = self.ctx.account_id,
                        order_id = %update.external_id,
                        status = update.status.as_str(),
                        "Update for archived order ignored"
                    );
                    return Ok(());
                }
                self.record_unknown(&update).await?
            }
        };

        let advanced = db
            .apply_order_state(order.id, update.status, update.executed_qty, update.avg_price)
            .await?;

        if !advanced {
            // Already terminal: a replay or a late event. Never regress it.
            debug!(
                account_id = self.ctx.account_id,
                order_id = %order.external_id,
                current = order.status.as_str(),
                incoming = update.status.as_str(),
                "Stale order update ignored"
            );
            db.archive_order(order.id).await?;
            return Ok(());
        }

        if update.status == OrderStatus::Filled {
            if is_exit(&order, &update) {
                self.apply_exit_fill(&order, &update).await?;
            } else {
                self.apply_entry_fill(&order, &update).await?;
            }
        }

        if update.status.is_terminal() {
            db.archive_order(order.id).await?;
        }

        Ok(())
    }

    async fn record_unknown(&self, update: &OrderUpdate) -> Result<Order> {
        let db = &self.ctx.db;
        let role = infer_role(
            update.order_type,
            &update.client_order_id,
            update.reduce_only,
            update.close_position,
        );

        let new = NewOrder {
            account_id: self.ctx.account_id,
            external_id: update.external_id.clone(),
            client_order_id: update.client_order_id.clone(),
            symbol: update.symbol.clone(),
            side: update.side,
            order_type: update.order_type,
            price: update.price,
            stop_price: update.stop_price,
            quantity: update.quantity,
            executed_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::New,
            bot_role: role,
            reduce_only: update.reduce_only,
            close_position: update.close_position,
            position_id: None,
            trailing_level: None,
            signal_id: None,
        };

        if let Some(id) = db.insert_order(&new).await? {
            info!(
                account_id = self.ctx.account_id,
                symbol = %update.symbol,
                order_id = %update.external_id,
                role = role.as_str(),
                "Recorded unknown order"
            );
            return db
                .get_order(id)
                .await?
                .context("Order vanished right after insert");
        }

        db.find_order(self.ctx.account_id, &update.symbol, &update.external_id)
            .await?
            .with_context(|| format!("Order {} collided but cannot be found", update.external_id))
    }

    async fn apply_entry_fill(&self, order: &Order, update: &OrderUpdate) -> Result<()> {
        let db = &self.ctx.db;
        let qty = filled_qty(update);
        let price = update.fill_price();

        if qty <= QTY_EPSILON {
            warn!(account_id = self.ctx.account_id, order_id = %order.external_id, "Filled order without quantity");
            return Ok(());
        }

        let Some(mut position) = db.find_open_position(self.ctx.account_id, &update.symbol).await? else {
            return self.open_from_fill(order, update.side, qty, price).await;
        };

        let effect = position.apply_fill(update.side, qty, price);
        db.save_position_state(&position).await?;
        debug!(
            account_id = self.ctx.account_id,
            position_id = position.id,
            effect = ?effect,
            "Fill applied to position"
        );

        match effect {
            FillEffect::Increased { .. } | FillEffect::Reduced { .. } => {
                db.set_order_position(order.id, position.id).await?;
            }
            FillEffect::Closed { .. } => {
                db.set_order_position(order.id, position.id).await?;
                self.close_and_archive(&position).await?;
            }
            FillEffect::Flipped { remainder, .. } => {
                self.close_and_archive(&position).await?;
                self.open_from_fill(order, update.side, remainder, price).await?;
            }
        }

        Ok(())
    }

    async fn open_from_fill(&self, order: &Order, side: Side, qty: f64, price: f64) -> Result<()> {
        let db = &self.ctx.db;

        let leverage = match order.signal_id {
            Some(signal_id) => db.get_signal(signal_id).await?.map_or(1, |s| s.leverage),
            None => 1,
        };

        let new = NewPosition {
            account_id: self.ctx.account_id,
            symbol: order.symbol.clone(),
            side,
            quantity: qty,
            entry_price: price,
            leverage,
            signal_id: order.signal_id,
        };

        let Some(position_id) = db.open_position(&new).await? else {
            warn!(
                account_id = self.ctx.account_id,
                symbol = %order.symbol,
                order_id = %order.external_id,
                "Open position already exists, fill left for reconciliation"
            );
            return Ok(());
        };

        db.set_order_position(order.id, position_id).await?;
        let linked = db
            .link_protective_orders(self.ctx.account_id, &order.symbol, position_id)
            .await?;
        if let Some(signal_id) = order.signal_id {
            db.link_signal_position(signal_id, position_id).await?;
        }

        info!(
            account_id = self.ctx.account_id,
            symbol = %order.symbol,
            position_id,
            side = %side,
            qty,
            price,
            protective_linked = linked,
            "Position opened"
        );

        Ok(())
    }

    /// Reduce-only and close-position fills are checked against the live
    /// exchange position before anything is archived.
    async fn apply_exit_fill(&self, order: &Order, update: &OrderUpdate) -> Result<()> {
        let db = &self.ctx.db;
        let Some(mut position) = db.find_open_position(self.ctx.account_id, &update.symbol).await? else {
            debug!(account_id = self.ctx.account_id, symbol = %update.symbol, "Exit fill with no open position");
            return Ok(());
        };

        db.set_order_position(order.id, position.id).await?;
        let price = update.fill_price();

        match self.exchange_amount(&update.symbol).await {
            Ok(amount) if amount.abs() <= QTY_EPSILON => {
                position.realized_pnl += position.pnl_for(position.quantity, price);
                position.quantity = 0.0;
                position.status = PositionStatus::Closed;
                db.save_position_state(&position).await?;
                self.close_and_archive(&position).await?;
            }
            Ok(amount) => {
                let remaining = amount.abs();
                if remaining + QTY_EPSILON < position.quantity {
                    position.realized_pnl += position.pnl_for(position.quantity - remaining, price);
                    position.quantity = remaining;
                    db.save_position_state(&position).await?;
                    info!(
                        account_id = self.ctx.account_id,
                        position_id = position.id,
                        remaining,
                        "Position reduced to exchange quantity"
                    );
                } else {
                    info!(
                        account_id = self.ctx.account_id,
                        position_id = position.id,
                        exchange_qty = remaining,
                        "Exit fill but exchange exposure unchanged"
                    );
                }
            }
            Err(e) => {
                // Book locally; a CLOSED row is archived by the next light cycle
                warn!(
                    account_id = self.ctx.account_id,
                    position_id = position.id,
                    error = %e,
                    "Exchange position unavailable, applying exit fill locally"
                );
                position.apply_fill(update.side, filled_qty(update).min(position.quantity), price);
                db.save_position_state(&position).await?;
            }
        }

        Ok(())
    }

    async fn exchange_amount(&self, symbol: &str) -> Result<f64> {
        let positions = self.ctx.exchange.positions().await?;
        Ok(positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map_or(0.0, |p| p.position_amt))
    }

    /// Cancel every live order of the position (plus unattached protective
    /// orders on the symbol), then archive the position.
    async fn close_and_archive(&self, position: &Position) -> Result<()> {
        let db = &self.ctx.db;
        let orders = db
            .active_orders_for_symbol(self.ctx.account_id, &position.symbol)
            .await?;

        for order in orders.iter().filter(|o| match o.position_id {
            Some(id) => id == position.id,
            None => matches!(o.bot_role, BotRole::StopLoss | BotRole::TakeProfit),
        }) {
            if let Err(e) = self
                .ctx
                .exchange
                .cancel_order(&order.symbol, &order.external_id)
                .await
            {
                warn!(
                    account_id = self.ctx.account_id,
                    order_id = %order.external_id,
                    error = %e,
                    "Cancel on close failed"
                );
            }
            db.mark_order_canceled(order.id).await?;
            if order.position_id.is_none() {
                db.set_order_position(order.id, position.id).await?;
            }
            tokio::time::sleep(self.ctx.config.inter_call_delay()).await;
        }

        if db.archive_position(position.id).await? {
            info!(
                account_id = self.ctx.account_id,
                symbol = %position.symbol,
                position_id = position.id,
                realized_pnl = position.realized_pnl,
                "Position closed and archived"
            );
            self.ctx.notifier.notify(
                self.ctx.account_id,
                format!(
                    "{} {} closed, realized PnL {:.4}",
                    position.symbol, position.side, position.realized_pnl
                ),
            );
        }

        Ok(())
    }
}

fn is_exit(order: &Order, update: &OrderUpdate) -> bool {
    update.reduce_only
        || update.close_position
        || order.reduce_only
        || order.close_position
        || matches!(
            order.bot_role,
            BotRole::Liquidation | BotRole::Adl | BotRole::Settlement
        )
}

fn filled_qty(update: &OrderUpdate) -> f64 {
    if update.executed_qty > QTY_EPSILON {
        update.executed_qty
    } else {
        update.quantity
    }
}

#[async_trait]
impl OrderUpdateListener for OrderReconciler {
    async fn on_order_update(&self, update: OrderUpdate) {
        let external_id = update.external_id.clone();
        if let Err(e) = self.handle_order_update(update).await {
            error!(account_id = self.ctx.account_id, order_id = %external_id, error = %e, "Order update failed");
        }
    }
}
