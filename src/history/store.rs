// =============================================================================
// HistoryStore — per-symbol append-only candle history, write-through
// =============================================================================
//
// Invariants:
//   - every series is strictly ascending by `time` (no duplicates);
//   - every successful or persistence-failed `append` leaves the candle in
//     memory; the in-memory map is authoritative for the running session;
//   - the whole map is re-serialized and handed to storage on every append.
//     The write runs on the blocking pool and `append` awaits it, so the
//     caller's loop is suspended (not blocked) until the blob is saved.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::storage::HistoryStorage;
use crate::error::PipelineError;
use crate::market_data::{Candle, SymbolSeries};
use crate::types::canonical_symbol;

/// Symbol -> ordered candle sequence, as persisted.
pub type HistoricalStore = BTreeMap<String, SymbolSeries>;

pub struct HistoryStore {
    series: HistoricalStore,
    storage: Arc<dyn HistoryStorage>,
    /// Retention cap per symbol; `None` keeps everything.
    max_candles: Option<usize>,
}

impl HistoryStore {
    /// Load persisted history. Never fails: unreadable or corrupt state is
    /// logged as a load failure and yields an empty store.
    pub fn load(storage: Arc<dyn HistoryStorage>, max_candles: Option<usize>) -> Self {
        let series = match storage.load() {
            Ok(Some(blob)) => match decode(&blob) {
                Ok(map) => sanitize(map, max_candles),
                Err(e) => {
                    let err = PipelineError::LoadFailure(format!("{e:#}"));
                    warn!(error = %err, "persisted history is corrupt, starting empty");
                    HistoricalStore::new()
                }
            },
            Ok(None) => {
                info!("no persisted history found, starting empty");
                HistoricalStore::new()
            }
            Err(e) => {
                let err = PipelineError::LoadFailure(format!("{e:#}"));
                warn!(error = %err, "persisted history unreadable, starting empty");
                HistoricalStore::new()
            }
        };

        info!(
            symbols = series.len(),
            candles = series.values().map(Vec::len).sum::<usize>(),
            "history loaded"
        );

        Self {
            series,
            storage,
            max_candles,
        }
    }

    /// Append a closed candle to `symbol`'s history and write the whole map
    /// through to storage.
    ///
    /// Returns `OutOfOrderCandle` (nothing appended) when `candle.time` does
    /// not advance past the last stored candle, and `PersistenceFailure` when
    /// the candle was appended in memory but the write failed.
    pub async fn append(&mut self, symbol: &str, candle: Candle) -> Result<(), PipelineError> {
        let symbol = canonical_symbol(symbol);
        let series = self.series.entry(symbol.clone()).or_default();

        if let Some(last) = series.last() {
            if candle.time <= last.time {
                return Err(PipelineError::OutOfOrderCandle {
                    symbol,
                    time: candle.time,
                    last: last.time,
                });
            }
        }

        series.push(candle);
        if let Some(max) = self.max_candles {
            trim_front(series, max);
        }

        debug!(
            symbol = %symbol,
            time = candle.time,
            close = candle.close,
            len = series.len(),
            "candle appended"
        );

        self.persist()
            .await
            .map_err(|e| PipelineError::PersistenceFailure(format!("{e:#}")))
    }

    /// Stored sequence for `symbol`, or an empty one if it was never seen.
    pub fn get_series(&self, symbol: &str) -> SymbolSeries {
        self.series(symbol).to_vec()
    }

    /// Borrowing variant of [`get_series`](Self::get_series).
    pub fn series(&self, symbol: &str) -> &[Candle] {
        self.series
            .get(&canonical_symbol(symbol))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn candle_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    async fn persist(&self) -> Result<()> {
        let blob = encode(&self.series)?;
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.save(&blob))
            .await
            .context("history write task failed")?
    }
}

// =============================================================================
// Serialization
// =============================================================================

pub fn encode(series: &HistoricalStore) -> Result<String> {
    serde_json::to_string(series).context("failed to serialise history to JSON")
}

pub fn decode(blob: &str) -> Result<HistoricalStore> {
    serde_json::from_str(blob).context("failed to parse persisted history JSON")
}

/// Canonicalise keys and enforce the ordering invariant on loaded data.
/// Series under keys that collide after canonicalisation are merged.
fn sanitize(raw: HistoricalStore, max_candles: Option<usize>) -> HistoricalStore {
    let mut merged = HistoricalStore::new();
    for (key, candles) in raw {
        merged
            .entry(canonical_symbol(&key))
            .or_insert_with(Vec::new)
            .extend(candles);
    }

    for (symbol, series) in merged.iter_mut() {
        series.sort_by_key(|c| c.time);
        let before = series.len();
        series.dedup_by_key(|c| c.time);
        if series.len() != before {
            warn!(
                symbol = %symbol,
                dropped = before - series.len(),
                "dropped duplicate candle times from persisted history"
            );
        }
        if let Some(max) = max_candles {
            trim_front(series, max);
        }
    }

    merged
}

fn trim_front(series: &mut SymbolSeries, max: usize) {
    if series.len() > max {
        let excess = series.len() - max;
        series.drain(..excess);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::storage::MemoryStorage;

    fn candle(time: i64, close: f64) -> Candle {
        Candle::new(time, close - 1.0, close + 2.0, close - 3.0, close)
    }

    fn store_with(storage: &MemoryStorage) -> HistoryStore {
        HistoryStore::load(Arc::new(storage.clone()), None)
    }

    #[tokio::test]
    async fn append_keeps_strictly_increasing_times() {
        let storage = MemoryStorage::default();
        let mut store = store_with(&storage);

        store.append("ETHUSDT", candle(1000, 10.0)).await.unwrap();
        store.append("ETHUSDT", candle(2000, 11.0)).await.unwrap();

        let dup = store.append("ETHUSDT", candle(2000, 12.0)).await;
        assert_eq!(
            dup,
            Err(PipelineError::OutOfOrderCandle {
                symbol: "ETHUSDT".into(),
                time: 2000,
                last: 2000
            })
        );
        assert!(matches!(
            store.append("ETHUSDT", candle(1500, 12.0)).await,
            Err(PipelineError::OutOfOrderCandle { .. })
        ));

        let times: Vec<i64> = store.series("ETHUSDT").iter().map(|c| c.time).collect();
        assert_eq!(times, vec![1000, 2000]);
        // Rejected candles are not written through.
        assert_eq!(storage.save_count(), 2);
    }

    #[tokio::test]
    async fn symbols_are_independent() {
        let mut store = store_with(&MemoryStorage::default());
        store.append("ETHUSDT", candle(2000, 10.0)).await.unwrap();
        store.append("BNBUSDT", candle(1000, 20.0)).await.unwrap();
        assert_eq!(store.series("ETHUSDT").len(), 1);
        assert_eq!(store.series("BNBUSDT").len(), 1);
        assert_eq!(store.candle_count(), 2);
        assert_eq!(store.symbols().collect::<Vec<_>>(), vec!["BNBUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn unseen_symbol_is_empty() {
        let store = store_with(&MemoryStorage::default());
        assert!(store.get_series("DOTUSDT").is_empty());
    }

    #[tokio::test]
    async fn symbol_lookup_is_case_insensitive() {
        let mut store = store_with(&MemoryStorage::default());
        store.append("ethusdt", candle(1000, 10.0)).await.unwrap();
        assert_eq!(store.series("ETHUSDT").len(), 1);
        assert_eq!(store.get_series(" EthUsdt ").len(), 1);
    }

    #[tokio::test]
    async fn every_append_writes_the_full_map_through() {
        let storage = MemoryStorage::default();
        let mut store = store_with(&storage);
        store.append("ETHUSDT", candle(1000, 10.0)).await.unwrap();
        store.append("BNBUSDT", candle(1000, 20.0)).await.unwrap();

        let persisted = decode(&storage.blob().unwrap()).unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted["ETHUSDT"], vec![candle(1000, 10.0)]);
        assert_eq!(persisted["BNBUSDT"], vec![candle(1000, 20.0)]);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_in_memory_append() {
        let storage = MemoryStorage::default();
        let mut store = store_with(&storage);
        storage.set_fail_saves(true);

        let result = store.append("ETHUSDT", candle(1000, 10.0)).await;
        assert!(matches!(result, Err(PipelineError::PersistenceFailure(_))));
        assert_eq!(store.series("ETHUSDT"), &[candle(1000, 10.0)]);
        assert_eq!(storage.blob(), None);

        // Next successful write carries the earlier candle too.
        storage.set_fail_saves(false);
        store.append("ETHUSDT", candle(2000, 11.0)).await.unwrap();
        let persisted = decode(&storage.blob().unwrap()).unwrap();
        assert_eq!(persisted["ETHUSDT"].len(), 2);
    }

    #[tokio::test]
    async fn slow_write_does_not_block_other_tasks() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let storage = MemoryStorage::default();
        storage.set_save_delay(Duration::from_millis(300));
        let mut store = store_with(&storage);

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        store.append("ETHUSDT", candle(1000, 10.0)).await.unwrap();
        ticker.abort();

        assert!(ticks.load(Ordering::SeqCst) >= 5, "ticks: {}", ticks.load(Ordering::SeqCst));
        assert_eq!(storage.save_count(), 1);
    }

    #[tokio::test]
    async fn reload_reproduces_the_same_mapping() {
        let storage = MemoryStorage::default();
        let mut store = store_with(&storage);
        for (i, sym) in ["ETHUSDT", "BNBUSDT", "DOTUSDT"].iter().enumerate() {
            for t in 1..=4 {
                let close = 100.0 * (i + 1) as f64 + t as f64 + 0.125;
                store.append(sym, candle(t * 60_000, close)).await.unwrap();
            }
        }

        let reloaded = store_with(&storage);
        for sym in ["ETHUSDT", "BNBUSDT", "DOTUSDT"] {
            assert_eq!(reloaded.series(sym), store.series(sym));
        }
        assert_eq!(reloaded.series, store.series);
    }

    #[tokio::test]
    async fn invalid_json_loads_empty_and_recovers() {
        let storage = MemoryStorage::with_blob("{not valid json");
        let mut store = store_with(&storage);
        assert_eq!(store.candle_count(), 0);

        store.append("ETHUSDT", candle(1000, 10.0)).await.unwrap();
        let persisted = decode(&storage.blob().unwrap()).unwrap();
        assert_eq!(persisted["ETHUSDT"], vec![candle(1000, 10.0)]);
    }

    #[tokio::test]
    async fn read_failure_loads_empty() {
        let storage = MemoryStorage::with_blob(r#"{"ETHUSDT":[]}"#);
        storage.set_fail_loads(true);
        let store = store_with(&storage);
        assert_eq!(store.symbols().count(), 0);
    }

    #[tokio::test]
    async fn wrong_shape_json_loads_empty() {
        let storage = MemoryStorage::with_blob(r#"{"ETHUSDT": [{"time": "soon"}]}"#);
        assert_eq!(store_with(&storage).candle_count(), 0);
    }

    #[tokio::test]
    async fn loaded_series_are_sorted_deduplicated_and_canonical() {
        let blob = r#"{
            "ethusdt": [
                {"time": 3000, "open": 1, "high": 1, "low": 1, "close": 3},
                {"time": 1000, "open": 1, "high": 1, "low": 1, "close": 1},
                {"time": 3000, "open": 1, "high": 1, "low": 1, "close": 9}
            ]
        }"#;
        let store = store_with(&MemoryStorage::with_blob(blob));
        let times: Vec<i64> = store.series("ETHUSDT").iter().map(|c| c.time).collect();
        assert_eq!(times, vec![1000, 3000]);
        assert_eq!(store.symbols().collect::<Vec<_>>(), vec!["ETHUSDT"]);
    }

    #[tokio::test]
    async fn retention_trims_oldest_candles() {
        let storage = MemoryStorage::default();
        let mut store = HistoryStore::load(Arc::new(storage.clone()), Some(3));
        for t in 1..=5 {
            store.append("ETHUSDT", candle(t * 1000, t as f64)).await.unwrap();
        }
        let times: Vec<i64> = store.series("ETHUSDT").iter().map(|c| c.time).collect();
        assert_eq!(times, vec![3000, 4000, 5000]);

        // A candle older than the retained window is still out of order.
        assert!(store.append("ETHUSDT", candle(2000, 2.0)).await.is_err());

        let reloaded = HistoryStore::load(Arc::new(storage.clone()), Some(2));
        assert_eq!(reloaded.series("ETHUSDT").len(), 2);
    }
}
