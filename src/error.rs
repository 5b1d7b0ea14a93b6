// =============================================================================
// Pipeline error taxonomy
// =============================================================================
//
// Every variant is locally recoverable. Plumbing code uses `anyhow` with
// context; failures are folded into one of these variants at component
// boundaries so callers can decide between log-and-drop and a user warning.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Stream payload could not be decoded into a candle.
    #[error("malformed stream event: {0}")]
    MalformedEvent(String),

    /// Candle time does not advance past the last stored candle.
    #[error("out-of-order candle for {symbol}: time {time} <= last stored {last}")]
    OutOfOrderCandle { symbol: String, time: i64, last: i64 },

    /// Write-through failed. The in-memory append has already happened.
    #[error("failed to persist history: {0}")]
    PersistenceFailure(String),

    /// Connection dropped, failed or timed out.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Persisted state unreadable or corrupt; treated as empty.
    #[error("failed to load persisted history: {0}")]
    LoadFailure(String),
}

impl PipelineError {
    /// Whether the condition deserves a (non-blocking) warning in the UI
    /// rather than only a log line.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::PersistenceFailure(_) | Self::TransportFailure(_)
        )
    }
}
