pub mod candle;
pub mod kline_stream;
pub mod normalizer;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::{Candle, SymbolSeries};
pub use kline_stream::{StreamConnection, StreamEvent, TungsteniteTransport};
