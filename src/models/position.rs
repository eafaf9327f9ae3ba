//! Position model: net exposure in one symbol for one account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Side;

/// Quantities at or below this are treated as flat.
pub const QTY_EPSILON: f64 = 1e-6;

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Where the protective stop sits relative to the profit targets.
///
/// Ordered: a position only ever moves up this ladder.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum TrailingLevel {
    Original,
    Breakeven,
    Tp1,
}

impl TrailingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrailingLevel::Original => "ORIGINAL",
            TrailingLevel::Breakeven => "BREAKEVEN",
            TrailingLevel::Tp1 => "TP1",
        }
    }

    /// Next rung of the ladder, if any.
    pub fn next(&self) -> Option<TrailingLevel> {
        match self {
            TrailingLevel::Original => Some(TrailingLevel::Breakeven),
            TrailingLevel::Breakeven => Some(TrailingLevel::Tp1),
            TrailingLevel::Tp1 => None,
        }
    }
}

/// Live position row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Position {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub average_price: f64,
    pub current_price: f64,
    pub leverage: i64,
    pub trailing_level: TrailingLevel,
    pub status: PositionStatus,
    pub realized_pnl: f64,
    pub signal_id: Option<i64>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Fields for opening a position row.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub account_id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: i64,
    pub signal_id: Option<i64>,
}

/// Outcome of applying a fill to a position.
#[derive(Debug, Clone, PartialEq)]
pub enum FillEffect {
    /// Same direction: size grew, average re-weighted.
    Increased { quantity: f64, average_price: f64 },
    /// Opposite direction, still open.
    Reduced { quantity: f64, realized_pnl: f64 },
    /// Opposite direction, now flat.
    Closed { realized_pnl: f64 },
    /// Opposite direction overshoot: closed, remainder opens the other way.
    Flipped { realized_pnl: f64, remainder: f64 },
}

impl Position {
    /// Apply an executed fill of `qty` at `price` on `side` to this position.
    ///
    /// Mutates quantity, average price and realized PnL; the caller persists.
    pub fn apply_fill(&mut self, side: Side, qty: f64, price: f64) -> FillEffect {
        if side == self.side {
            let new_qty = self.quantity + qty;
            if new_qty > QTY_EPSILON {
                self.average_price =
                    (self.average_price * self.quantity + price * qty) / new_qty;
            }
            self.quantity = new_qty;
            return FillEffect::Increased {
                quantity: self.quantity,
                average_price: self.average_price,
            };
        }

        let closed_qty = qty.min(self.quantity);
        let pnl = self.pnl_for(closed_qty, price);
        self.realized_pnl += pnl;
        let remaining = self.quantity - qty;

        if remaining.abs() <= QTY_EPSILON {
            self.quantity = 0.0;
            self.status = PositionStatus::Closed;
            FillEffect::Closed { realized_pnl: pnl }
        } else if remaining < 0.0 {
            self.quantity = 0.0;
            self.status = PositionStatus::Closed;
            FillEffect::Flipped {
                realized_pnl: pnl,
                remainder: -remaining,
            }
        } else {
            self.quantity = remaining;
            FillEffect::Reduced {
                quantity: remaining,
                realized_pnl: pnl,
            }
        }
    }

    /// PnL of closing `qty` at `exit_price` against the average entry.
    pub fn pnl_for(&self, qty: f64, exit_price: f64) -> f64 {
        let diff = exit_price - self.average_price;
        match self.side {
            Side::Buy => qty * diff,
            Side::Sell => -qty * diff,
        }
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.pnl_for(self.quantity, self.current_price)
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() <= QTY_EPSILON
    }
}

#[cfg(test)]
pub(crate) fn sample_position(side: Side, quantity: f64, price: f64) -> Position {
    let now = Utc::now();
    Position {
        id: 1,
        account_id: 1,
        symbol: "BTCUSDT".to_string(),
        side,
        quantity,
        entry_price: price,
        average_price: price,
        current_price: price,
        leverage: 10,
        trailing_level: TrailingLevel::Original,
        status: PositionStatus::Open,
        realized_pnl: 0.0,
        signal_id: None,
        opened_at: now,
        updated_at: now,
        closed_at: None,
    }
}
