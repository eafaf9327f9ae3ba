//! Engine configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Timing and sizing knobs shared by every account engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds allowed for a websocket connect
    pub connect_timeout_secs: u64,

    /// Seconds allowed for a WS API or REST round trip
    pub request_timeout_secs: u64,

    /// Seconds a cached price stays valid
    pub price_ttl_secs: u64,

    /// Minimum seconds between trailing evaluations of one position
    pub trailing_interval_secs: u64,

    /// Milliseconds to wait for stop cancellations to settle
    pub settle_delay_ms: u64,

    /// Milliseconds between consecutive exchange calls in cleanup loops
    pub inter_call_delay_ms: u64,

    /// Seconds between light archival cycles
    pub archival_interval_secs: u64,

    /// Seconds between heavy reconciliation passes
    pub heavy_pass_interval_secs: u64,

    /// Seconds between session/feed health checks
    pub health_check_interval_secs: u64,

    /// Seconds between sweeps for signals on symbols with no live feed
    pub unfed_sweep_interval_secs: u64,

    /// Seconds a signal may stay PROCESSING before the archival cycle settles it
    pub processing_timeout_secs: u64,

    /// Minutes between listen-key keepalives
    pub listen_key_keepalive_mins: u64,

    /// Notional in quote currency used when a signal carries no quantity
    pub default_notional: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            request_timeout_secs: 30,
            price_ttl_secs: 30,
            trailing_interval_secs: 10,
            settle_delay_ms: 2500,
            inter_call_delay_ms: 150,
            archival_interval_secs: 60,      // Light cycle every minute
            heavy_pass_interval_secs: 600,   // Ghost/orphan pass every 10 min
            health_check_interval_secs: 15,
            unfed_sweep_interval_secs: 30,
            processing_timeout_secs: 300,
            listen_key_keepalive_mins: 30,
            default_notional: 20.0,          // 20 USDT per entry
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `PM_*` environment variable that is set:
    /// - PM_CONNECT_TIMEOUT_SECS, PM_REQUEST_TIMEOUT_SECS, PM_PRICE_TTL_SECS
    /// - PM_TRAILING_INTERVAL_SECS, PM_SETTLE_DELAY_MS, PM_INTER_CALL_DELAY_MS
    /// - PM_ARCHIVAL_INTERVAL_SECS, PM_HEAVY_PASS_INTERVAL_SECS
    /// - PM_HEALTH_CHECK_INTERVAL_SECS, PM_UNFED_SWEEP_INTERVAL_SECS
    /// - PM_PROCESSING_TIMEOUT_SECS
    /// - PM_LISTEN_KEY_KEEPALIVE_MINS, PM_DEFAULT_NOTIONAL
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        override_from_env("PM_CONNECT_TIMEOUT_SECS", &mut config.connect_timeout_secs)?;
        override_from_env("PM_REQUEST_TIMEOUT_SECS", &mut config.request_timeout_secs)?;
        override_from_env("PM_PRICE_TTL_SECS", &mut config.price_ttl_secs)?;
        override_from_env("PM_TRAILING_INTERVAL_SECS", &mut config.trailing_interval_secs)?;
        override_from_env("PM_SETTLE_DELAY_MS", &mut config.settle_delay_ms)?;
        override_from_env("PM_INTER_CALL_DELAY_MS", &mut config.inter_call_delay_ms)?;
        override_from_env("PM_ARCHIVAL_INTERVAL_SECS", &mut config.archival_interval_secs)?;
        override_from_env("PM_HEAVY_PASS_INTERVAL_SECS", &mut config.heavy_pass_interval_secs)?;
        override_from_env("PM_HEALTH_CHECK_INTERVAL_SECS", &mut config.health_check_interval_secs)?;
        override_from_env("PM_UNFED_SWEEP_INTERVAL_SECS", &mut config.unfed_sweep_interval_secs)?;
        override_from_env("PM_PROCESSING_TIMEOUT_SECS", &mut config.processing_timeout_secs)?;
        override_from_env("PM_LISTEN_KEY_KEEPALIVE_MINS", &mut config.listen_key_keepalive_mins)?;
        override_from_env("PM_DEFAULT_NOTIONAL", &mut config.default_notional)?;

        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn price_ttl(&self) -> Duration {
        Duration::from_secs(self.price_ttl_secs)
    }

    pub fn trailing_interval(&self) -> Duration {
        Duration::from_secs(self.trailing_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.inter_call_delay_ms)
    }

    pub fn archival_interval(&self) -> Duration {
        Duration::from_secs(self.archival_interval_secs)
    }

    pub fn heavy_pass_interval(&self) -> Duration {
        Duration::from_secs(self.heavy_pass_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn unfed_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.unfed_sweep_interval_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn listen_key_keepalive(&self) -> Duration {
        Duration::from_secs(self.listen_key_keepalive_mins * 60)
    }

    /// Config with zero delays for tests.
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            settle_delay_ms: 0,
            inter_call_delay_ms: 0,
            trailing_interval_secs: 0,
            ..Self::default()
        }
    }
}

fn override_from_env<T>(name: &str, slot: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = std::env::var(name) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {:?}", name, raw))?;
    }
    Ok(())
}
