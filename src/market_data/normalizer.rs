// =============================================================================
// Candle Normalizer — Binance kline payload -> Candle
// =============================================================================
//
// Pure transform. Only closed klines (`k.x == true`) become candles; anything
// that fails to decode is reported as `Rejected::Malformed` and never escapes
// as a panic or an error that would stop the connection.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::Value;

use super::Candle;
use crate::error::PipelineError;

/// Why a frame did not produce a candle.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejected {
    /// Well-formed kline whose interval has not closed yet.
    InProgress { time: i64 },
    /// Payload could not be decoded.
    Malformed(String),
}

impl Rejected {
    /// In-progress klines are expected traffic, not errors.
    pub fn into_error(self) -> Option<PipelineError> {
        match self {
            Self::InProgress { .. } => None,
            Self::Malformed(reason) => Some(PipelineError::MalformedEvent(reason)),
        }
    }
}

/// Normalize one raw stream frame.
///
/// Accepts the single-stream shape `{ "e": "kline", "k": { ... } }` as well
/// as the combined-stream envelope `{ "stream": ..., "data": { "k": ... } }`.
pub fn normalize(text: &str) -> Result<Candle, Rejected> {
    let (candle, is_closed) =
        decode_kline(text).map_err(|e| Rejected::Malformed(format!("{e:#}")))?;
    if is_closed {
        Ok(candle)
    } else {
        Err(Rejected::InProgress { time: candle.time })
    }
}

fn decode_kline(text: &str) -> Result<(Candle, bool)> {
    let root: Value = serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let k = data.get("k").context("missing field k")?;

    let time = k["t"].as_i64().context("missing field k.t")?;
    let open = parse_string_f64(&k["o"], "k.o")?;
    let high = parse_string_f64(&k["h"], "k.h")?;
    let low = parse_string_f64(&k["l"], "k.l")?;
    let close = parse_string_f64(&k["c"], "k.c")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok((Candle::new(time, open, high, low, close), is_closed))
}

/// Binance sends prices as JSON strings inside kline objects.
fn parse_string_f64(val: &Value, name: &str) -> Result<f64> {
    let parsed = match val {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s:?}"))?,
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        Value::Null => anyhow::bail!("missing field {name}"),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    };
    anyhow::ensure!(parsed.is_finite(), "field {name} is not finite: {parsed}");
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(t: i64, c: &str, x: bool) -> String {
        format!(
            r#"{{"e":"kline","E":{t},"s":"ETHUSDT","k":{{"t":{t},"T":{},"s":"ETHUSDT","i":"1m","o":"100","h":"110","l":"95","c":"{c}","v":"12.5","x":{x}}}}}"#,
            t + 59_999
        )
    }

    #[test]
    fn closed_kline_becomes_candle() {
        let candle = normalize(&frame(1000, "106", true)).expect("closed kline");
        assert_eq!(candle, Candle::new(1000, 100.0, 110.0, 95.0, 106.0));
    }

    #[test]
    fn open_kline_is_in_progress() {
        assert_eq!(
            normalize(&frame(1000, "105", false)),
            Err(Rejected::InProgress { time: 1000 })
        );
    }

    #[test]
    fn combined_stream_envelope_is_accepted() {
        let json = r#"{
            "stream": "bnbusdt@kline_5m",
            "data": {
                "e": "kline",
                "s": "BNBUSDT",
                "k": { "t": 1700000000000, "o": "230.1", "h": "231.0",
                       "l": "229.5", "c": "230.7", "x": true }
            }
        }"#;
        let candle = normalize(json).expect("should parse");
        assert_eq!(candle.time, 1_700_000_000_000);
        assert!((candle.close - 230.7).abs() < f64::EPSILON);
    }

    #[test]
    fn numeric_json_values_are_accepted() {
        let json = r#"{"k":{"t":5,"o":1,"h":2.5,"l":0.5,"c":2,"x":true}}"#;
        assert_eq!(normalize(json), Ok(Candle::new(5, 1.0, 2.5, 0.5, 2.0)));
    }

    #[test]
    fn non_numeric_close_is_malformed() {
        match normalize(&frame(1000, "abc", true)) {
            Err(Rejected::Malformed(reason)) => assert!(reason.contains("k.c"), "{reason}"),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn nan_price_is_malformed() {
        assert!(matches!(
            normalize(&frame(1000, "NaN", true)),
            Err(Rejected::Malformed(_))
        ));
    }

    #[test]
    fn missing_fields_are_malformed() {
        for json in [
            r#"{"e":"kline"}"#,
            r#"{"k":{"o":"1","h":"1","l":"1","c":"1","x":true}}"#,
            r#"{"k":{"t":1,"o":"1","h":"1","l":"1","c":"1"}}"#,
            r#"{"k":{"t":1,"o":"1","h":"1","c":"1","x":true}}"#,
        ] {
            assert!(
                matches!(normalize(json), Err(Rejected::Malformed(_))),
                "accepted {json}"
            );
        }
    }

    #[test]
    fn garbage_payload_is_malformed() {
        assert!(matches!(normalize("not json {"), Err(Rejected::Malformed(_))));
        assert!(matches!(normalize("[1,2,3]"), Err(Rejected::Malformed(_))));
    }

    #[test]
    fn rejection_maps_into_taxonomy() {
        assert!(Rejected::InProgress { time: 1 }.into_error().is_none());
        assert_eq!(
            Rejected::Malformed("x".into()).into_error(),
            Some(PipelineError::MalformedEvent("x".into()))
        );
    }
}
