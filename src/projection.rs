// =============================================================================
// Series Projection — candle history -> renderer-ready series
// =============================================================================

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

/// Parallel time/price arrays for a line chart of close prices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectedSeries {
    pub timestamps: Vec<i64>,
    pub prices: Vec<f64>,
}

/// One entry per candle, same order as `series`.
pub fn project(series: &[Candle]) -> ProjectedSeries {
    ProjectedSeries {
        timestamps: series.iter().map(|c| c.time).collect(),
        prices: series.iter().map(|c| c.close).collect(),
    }
}

impl ProjectedSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    #[cfg(test)]
    pub fn last_price(&self) -> Option<f64> {
        self.prices.last().copied()
    }

    /// RFC 3339 UTC labels for the time axis. Out-of-range timestamps fall
    /// back to the raw millisecond value.
    pub fn labels(&self) -> Vec<String> {
        self.timestamps
            .iter()
            .map(|&ms| {
                DateTime::from_timestamp_millis(ms)
                    .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_else(|| ms.to_string())
            })
            .collect()
    }
}
