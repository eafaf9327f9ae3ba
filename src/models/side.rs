//! Order / position direction.

use serde::{Deserialize, Serialize};

/// Direction of an order or a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// The side that closes a position opened on this side.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// True when `price` has moved at or beyond `level` in this side's favour.
    pub fn reached(&self, price: f64, level: f64) -> bool {
        match self {
            Side::Buy => price >= level,
            Side::Sell => price <= level,
        }
    }

    /// True when `price` is at or through `stop` against this side.
    pub fn breached(&self, price: f64, stop: f64) -> bool {
        match self {
            Side::Buy => price <= stop,
            Side::Sell => price >= stop,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Side::Buy),
            "SELL" | "SHORT" => Ok(Side::Sell),
            other => anyhow::bail!("Unknown side: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directional_checks() {
        assert!(Side::Buy.reached(105.0, 105.0));
        assert!(!Side::Buy.reached(104.9, 105.0));
        assert!(Side::Sell.reached(94.0, 95.0));

        assert!(Side::Buy.breached(95.0, 95.0));
        assert!(!Side::Buy.breached(96.0, 95.0));
        assert!(Side::Sell.breached(106.0, 105.0));
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("long".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
    }
}
