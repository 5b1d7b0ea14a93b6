use serde::{Deserialize, Serialize};

/// One closed OHLC interval, keyed by its interval-start time (epoch millis).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
        }
    }
}

/// Candles for one symbol, strictly ascending by `time`.
pub type SymbolSeries = Vec<Candle>;
