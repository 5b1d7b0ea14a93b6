// =============================================================================
// Shared types used across the candle feed
// =============================================================================

use serde::{Deserialize, Serialize};

/// Canonical form of a symbol inside the core: trimmed and uppercased.
///
/// The stream address lowercases it again; everything else (history keys,
/// selection, API payloads) uses this form.
pub fn canonical_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// The (symbol, interval) pair the user is currently looking at.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub symbol: String,
    pub interval: String,
}

impl Selection {
    /// Build a selection with a canonical symbol. Intervals keep their case
    /// (`1m` and `1M` are different Binance intervals).
    pub fn new(symbol: &str, interval: &str) -> Self {
        Self {
            symbol: canonical_symbol(symbol),
            interval: interval.trim().to_string(),
        }
    }

    pub fn with_symbol(&self, symbol: &str) -> Self {
        Self::new(symbol, &self.interval)
    }

    pub fn with_interval(&self, interval: &str) -> Self {
        Self::new(&self.symbol, interval)
    }

    /// Binance stream name, e.g. `ethusdt@kline_1m`.
    pub fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), self.interval)
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Lifecycle of a single kline subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Category of a user-visible, non-blocking warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    Persistence,
    Transport,
}

impl std::fmt::Display for WarningKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistence => write!(f, "Persistence"),
            Self::Transport => write!(f, "Transport"),
        }
    }
}
