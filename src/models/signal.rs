//! Signal model: an externally submitted trade intent awaiting a price trigger.

use anyhow::{ensure, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Side;

/// Lifetime used when a signal carries no timeframe, deadline or max lifetime.
pub const FALLBACK_SIGNAL_LIFETIME_HOURS: i64 = 6;

/// Number of timeframe candles a signal may wait for its entry.
const TIMEFRAME_MULTIPLIER: i32 = 3;

/// Signal lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Canceled,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "PENDING",
            SignalStatus::Processing => "PROCESSING",
            SignalStatus::Completed => "COMPLETED",
            SignalStatus::Error => "ERROR",
            SignalStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SignalStatus::Completed | SignalStatus::Error | SignalStatus::Canceled
        )
    }
}

/// Trade signal as stored in the `signals` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Signal {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit1: f64,
    pub take_profit2: Option<f64>,
    pub take_profit3: Option<f64>,
    /// Order quantity in base asset; sized from config when absent
    pub quantity: Option<f64>,
    pub leverage: i64,
    /// Candle timeframe such as "5m" or "4h"
    pub timeframe: Option<String>,
    /// Explicit deadline for the entry
    pub expires_at: Option<DateTime<Utc>>,
    /// Explicit maximum lifetime in seconds
    pub max_lifetime_secs: Option<i64>,
    pub status: SignalStatus,
    pub position_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
}

/// Fields needed to submit a new signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSignal {
    pub account_id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit1: f64,
    pub take_profit2: Option<f64>,
    pub take_profit3: Option<f64>,
    pub quantity: Option<f64>,
    pub leverage: i64,
    pub timeframe: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_lifetime_secs: Option<i64>,
}

impl NewSignal {
    /// Reject signals whose prices are not laid out around the entry in the
    /// signal's direction.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.symbol.trim().is_empty(), "Symbol is empty");
        let prices = [
            Some(self.entry_price),
            Some(self.stop_loss),
            Some(self.take_profit1),
            self.take_profit2,
            self.take_profit3,
        ];
        ensure!(
            prices.iter().flatten().all(|p| p.is_finite() && *p > 0.0),
            "Prices must be positive"
        );
        ensure!(
            self.side.breached(self.stop_loss, self.entry_price) && self.stop_loss != self.entry_price,
            "Stop loss {} is not on the losing side of entry {} for {}",
            self.stop_loss,
            self.entry_price,
            self.side
        );
        ensure!(
            self.side.reached(self.take_profit1, self.entry_price) && self.take_profit1 != self.entry_price,
            "Take profit {} is not beyond entry {} for {}",
            self.take_profit1,
            self.entry_price,
            self.side
        );
        ensure!((1..=125).contains(&self.leverage), "Leverage {} out of range 1-125", self.leverage);
        if let Some(qty) = self.quantity {
            ensure!(qty.is_finite() && qty > 0.0, "Quantity must be positive");
        }
        if let Some(tf) = &self.timeframe {
            ensure!(parse_timeframe(tf).is_some(), "Unknown timeframe {:?}", tf);
        }
        Ok(())
    }
}

impl Signal {
    /// Instant after which an untriggered signal is canceled.
    ///
    /// Precedence: timeframe x3, explicit deadline, max lifetime, 6h fallback.
    pub fn expiry(&self) -> DateTime<Utc> {
        if let Some(tf) = self.timeframe.as_deref().and_then(parse_timeframe) {
            return self.created_at + tf * TIMEFRAME_MULTIPLIER;
        }
        if let Some(deadline) = self.expires_at {
            return deadline;
        }
        if let Some(secs) = self.max_lifetime_secs.filter(|s| *s > 0) {
            return self.created_at + Duration::seconds(secs);
        }
        self.created_at + Duration::hours(FALLBACK_SIGNAL_LIFETIME_HOURS)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry()
    }

    /// Human readable reason recorded when the signal times out.
    pub fn expiry_reason(&self) -> String {
        match self.timeframe.as_deref().filter(|tf| parse_timeframe(tf).is_some()) {
            Some(tf) => format!("Entry not reached within 3 x {} candles", tf),
            None if self.expires_at.is_some() => "Entry deadline passed".to_string(),
            None if self.max_lifetime_secs.is_some() => "Maximum signal lifetime exceeded".to_string(),
            None => format!(
                "Entry not reached within {}h fallback lifetime",
                FALLBACK_SIGNAL_LIFETIME_HOURS
            ),
        }
    }

    /// True when the price has already crossed the stop before any entry.
    pub fn stop_breached(&self, price: f64) -> bool {
        self.side.breached(price, self.stop_loss)
    }

    /// True when the price satisfies the entry condition.
    pub fn entry_triggered(&self, price: f64) -> bool {
        self.side.reached(price, self.entry_price)
    }

    /// Furthest configured profit target.
    pub fn final_target(&self) -> f64 {
        self.take_profit3
            .or(self.take_profit2)
            .unwrap_or(self.take_profit1)
    }
}

/// Parse a candle timeframe ("1m", "15m", "4h", "1d", "1w") into a duration.
pub fn parse_timeframe(tf: &str) -> Option<Duration> {
    let tf = tf.trim();
    if tf.len() < 2 {
        return None;
    }
    let (count, unit) = tf.split_at(tf.len() - 1);
    let count: i64 = count.parse().ok().filter(|c| *c > 0)?;
    match unit {
        "m" => Some(Duration::minutes(count)),
        "h" | "H" => Some(Duration::hours(count)),
        "d" | "D" => Some(Duration::days(count)),
        "w" | "W" => Some(Duration::weeks(count)),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn sample_signal(created_at: DateTime<Utc>) -> Signal {
    Signal {
        id: 1,
        account_id: 1,
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        entry_price: 100.0,
        stop_loss: 95.0,
        take_profit1: 105.0,
        take_profit2: Some(110.0),
        take_profit3: Some(115.0),
        quantity: Some(0.01),
        leverage: 10,
        timeframe: Some("5m".to_string()),
        expires_at: None,
        max_lifetime_secs: None,
        status: SignalStatus::Pending,
        position_id: None,
        error_message: None,
        created_at,
        updated_at: created_at,
        triggered_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_signal() -> NewSignal {
        NewSignal {
            account_id: 1,
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            entry_price: 100.0,
            stop_loss: 95.0,
            take_profit1: 105.0,
            take_profit2: None,
            take_profit3: None,
            quantity: None,
            leverage: 10,
            timeframe: Some("15m".to_string()),
            expires_at: None,
            max_lifetime_secs: None,
        }
    }

    #[test]
    fn test_validate_price_layout() {
        assert!(new_signal().validate().is_ok());

        let mut inverted = new_signal();
        inverted.side = Side::Sell;
        assert!(inverted.validate().is_err());
        inverted.stop_loss = 105.0;
        inverted.take_profit1 = 95.0;
        assert!(inverted.validate().is_ok());

        let mut bad_tf = new_signal();
        bad_tf.timeframe = Some("7x".to_string());
        assert!(bad_tf.validate().is_err());

        let mut no_leverage = new_signal();
        no_leverage.leverage = 0;
        assert!(no_leverage.validate().is_err());
    }

    #[test]
    fn test_parse_timeframe() {
        assert_eq!(parse_timeframe("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_timeframe("4h"), Some(Duration::hours(4)));
        assert_eq!(parse_timeframe("1d"), Some(Duration::days(1)));
        assert_eq!(parse_timeframe("0m"), None);
        assert_eq!(parse_timeframe("m"), None);
        assert_eq!(parse_timeframe("5x"), None);
    }

    #[test]
    fn test_five_minute_signal_expires_at_fifteen_minutes() {
        let t = Utc::now();
        let signal = sample_signal(t);

        assert!(!signal.is_expired(t + Duration::minutes(14) + Duration::seconds(59)));
        assert!(signal.is_expired(t + Duration::minutes(15)));
        assert!(signal.is_expired(t + Duration::hours(1)));
    }

    #[test]
    fn test_expiry_precedence() {
        let t = Utc::now();
        let mut signal = sample_signal(t);
        signal.timeframe = None;
        signal.expires_at = Some(t + Duration::minutes(42));
        signal.max_lifetime_secs = Some(60);
        assert_eq!(signal.expiry(), t + Duration::minutes(42));

        signal.expires_at = None;
        assert_eq!(signal.expiry(), t + Duration::seconds(60));

        signal.max_lifetime_secs = None;
        assert_eq!(signal.expiry(), t + Duration::hours(6));

        // An unparseable timeframe falls through to the next rule
        signal.timeframe = Some("soon".to_string());
        assert_eq!(signal.expiry(), t + Duration::hours(6));
    }

    #[test]
    fn test_final_target() {
        let mut signal = sample_signal(Utc::now());
        assert_eq!(signal.final_target(), 115.0);
        signal.take_profit3 = None;
        assert_eq!(signal.final_target(), 110.0);
        signal.take_profit2 = None;
        assert_eq!(signal.final_target(), 105.0);
    }
}
