// =============================================================================
// Runtime Configuration — stream, history and API settings
// =============================================================================
//
// Loaded once at startup from `candle_feed.json`. All fields carry
// `#[serde(default)]` so that a partial (or missing) file still yields a
// usable configuration. A handful of environment variables override the file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_stream_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_history_path() -> String {
    "historical_data.json".to_string()
}

fn default_symbol() -> String {
    "ETHUSDT".to_string()
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_symbols() -> Vec<String> {
    vec![
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "DOTUSDT".to_string(),
    ]
}

fn default_intervals() -> Vec<String> {
    vec!["1m".to_string(), "5m".to_string(), "15m".to_string()]
}

fn default_connect_timeout_secs() -> Option<u64> {
    Some(10)
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    32_000
}

fn default_max_retries() -> u32 {
    8
}

fn default_stable_after_ms() -> u64 {
    30_000
}

// =============================================================================
// ReconnectPolicy
// =============================================================================

/// Bounded exponential backoff applied after a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failed attempts after which the coordinator gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// A connection that stayed open this long before dropping starts a
    /// fresh failure count. A delivered candle also clears it.
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            stable_after_ms: default_stable_after_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based):
    /// `min(initial * 2^(attempt - 1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    /// Whether another retry is allowed after `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the candle feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Stream ---------------------------------------------------------------

    /// Base URL of the kline stream; the stream name is appended as a path.
    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    /// Bounded connect timeout. `null` waits indefinitely.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    // --- Selection ------------------------------------------------------------

    /// Symbol selected at startup.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Interval selected at startup.
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Symbols offered to the selection controls.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Intervals offered to the selection controls.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<String>,

    // --- History --------------------------------------------------------------

    /// File holding the persisted history blob.
    #[serde(default = "default_history_path")]
    pub history_path: String,

    /// Per-symbol retention cap. `null` keeps history unbounded.
    #[serde(default)]
    pub max_candles_per_symbol: Option<usize>,

    // --- API ------------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stream_base_url: default_stream_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect: ReconnectPolicy::default(),
            symbol: default_symbol(),
            interval: default_interval(),
            symbols: default_symbols(),
            intervals: default_intervals(),
            history_path: default_history_path(),
            max_candles_per_symbol: None,
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            interval = %config.interval,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply `CANDLE_FEED_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(symbol) = get("CANDLE_FEED_SYMBOL") {
            self.symbol = symbol;
        }
        if let Some(interval) = get("CANDLE_FEED_INTERVAL") {
            self.interval = interval;
        }
        if let Some(path) = get("CANDLE_FEED_HISTORY_PATH") {
            self.history_path = path;
        }
        if let Some(addr) = get("CANDLE_FEED_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(url) = get("CANDLE_FEED_STREAM_URL") {
            self.stream_base_url = url;
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}
