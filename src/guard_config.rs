// =============================================================================
// Guard Configuration — credentials, thresholds, and loop tuning
// =============================================================================
//
// Loaded once from a JSON file at startup and never mutated afterwards. Only
// `stop_loss_usd` is mandatory in the file; credentials may come from the
// environment instead, and every tuning key carries a serde default.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bitunix::client::DEFAULT_BASE_URL;
use crate::pnl::Thresholds;
use crate::retry::Backoff;

/// Env vars consulted when the file leaves credentials blank.
pub const API_KEY_ENV: &str = "BITUNIX_API_KEY";
pub const SECRET_KEY_ENV: &str = "BITUNIX_SECRET_KEY";

/// Quote asset appended to bare tickers.
const QUOTE_ASSET: &str = "USDT";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_max_close_attempts() -> u32 {
    3
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

// =============================================================================
// GuardConfig
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    // --- Credentials ---------------------------------------------------------
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub secret_key: String,

    // --- Thresholds ---------------------------------------------------------

    /// Close when the unrealized loss reaches this many USD. Must be > 0.
    pub stop_loss_usd: f64,

    /// Close when the unrealized gain reaches this percentage (0 < tp <= 100).
    #[serde(default)]
    pub take_profit_pct: Option<f64>,

    /// Symbol to guard, e.g. "BTCUSDT" or just "BTC". When absent the guard
    /// locks onto the single open position it finds.
    #[serde(default)]
    pub symbol: Option<String>,

    // --- Loop tuning --------------------------------------------------------
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Consecutive transient failures tolerated before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Close-order submissions allowed per position before erroring out.
    #[serde(default = "default_max_close_attempts")]
    pub max_close_attempts: u32,

    /// Also keep a position-linked TP/SL order on the exchange as a backstop.
    #[serde(default)]
    pub exchange_side_orders: bool,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl GuardConfig {
    /// Load configuration from a JSON file at `path`, fill blank credentials
    /// from the environment, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read guard config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse guard config from {}", path.display()))?;

        config.fill_credentials_from_env();
        config.symbol = config.symbol.as_deref().and_then(normalise_symbol);
        config.validate()?;

        info!(
            path = %path.display(),
            symbol = ?config.symbol,
            stop_loss_usd = config.stop_loss_usd,
            take_profit_pct = ?config.take_profit_pct,
            poll_interval_secs = config.poll_interval_secs,
            exchange_side_orders = config.exchange_side_orders,
            "guard config loaded"
        );

        Ok(config)
    }

    fn fill_credentials_from_env(&mut self) {
        if self.api_key.trim().is_empty() {
            self.api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
        }
        if self.secret_key.trim().is_empty() {
            self.secret_key = std::env::var(SECRET_KEY_ENV).unwrap_or_default();
        }
    }

    /// Reject configurations the guard cannot safely run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            bail!("api_key is missing (set it in the config file or {API_KEY_ENV})");
        }
        if self.secret_key.trim().is_empty() {
            bail!("secret_key is missing (set it in the config file or {SECRET_KEY_ENV})");
        }
        if !self.stop_loss_usd.is_finite() || self.stop_loss_usd <= 0.0 {
            bail!("stop_loss_usd must be a positive number, got {}", self.stop_loss_usd);
        }
        if let Some(tp) = self.take_profit_pct {
            if !tp.is_finite() || tp <= 0.0 || tp > 100.0 {
                bail!("take_profit_pct must be in (0, 100], got {tp}");
            }
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be at least 1");
        }
        if self.max_close_attempts == 0 {
            bail!("max_close_attempts must be at least 1");
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            bail!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms,
                self.backoff_max_ms
            );
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            stop_loss_usd: self.stop_loss_usd,
            take_profit_pct: self.take_profit_pct,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

impl std::fmt::Debug for GuardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardConfig")
            .field("api_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("stop_loss_usd", &self.stop_loss_usd)
            .field("take_profit_pct", &self.take_profit_pct)
            .field("symbol", &self.symbol)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("max_retries", &self.max_retries)
            .field("max_close_attempts", &self.max_close_attempts)
            .field("exchange_side_orders", &self.exchange_side_orders)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Upper-case and append the quote asset to bare tickers ("btc" -> "BTCUSDT").
/// Blank input means "no symbol".
pub fn normalise_symbol(raw: &str) -> Option<String> {
    let s = raw.trim().to_uppercase();
    if s.is_empty() {
        return None;
    }
    if s.ends_with(QUOTE_ASSET) {
        Some(s)
    } else {
        Some(format!("{s}{QUOTE_ASSET}"))
    }
}
