// =============================================================================
// Kline Stream Connection — one live subscription per (symbol, interval)
// =============================================================================
//
// State machine: Disconnected -> Connecting -> Open -> Closed.
//
// `open()` spawns a reader task that connects through a `KlineTransport`,
// normalizes every text frame and forwards closed candles as `StreamEvent`s
// tagged with the connection generation. `close()` aborts the task. Every
// `open()` gets a fresh state cell, so an aborted reader can never flip the
// state of the subscription that replaced it; events it queued before the
// abort still carry the old generation and are discarded by the receiver.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use super::normalizer::{normalize, Rejected};
use super::Candle;
use crate::error::PipelineError;
use crate::types::{ConnectionState, Selection};

/// Intervals Binance serves on the kline channel.
const SUPPORTED_INTERVALS: &[&str] = &[
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d",
    "1w", "1M",
];

// =============================================================================
// Transport seam
// =============================================================================

/// Text frames of one established connection. The stream ending, or yielding
/// an error, means the transport is gone.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Establishes the underlying connection for a stream URL.
pub trait KlineTransport: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<FrameStream>>;
}

/// WebSocket transport over `tokio-tungstenite`.
pub struct TungsteniteTransport;

impl KlineTransport for TungsteniteTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<FrameStream>> {
        async move {
            let (ws_stream, _response) = connect_async(url.as_str())
                .await
                .with_context(|| format!("failed to connect to {url}"))?;

            // Ping / Pong / Binary / Close frames are dropped here;
            // tungstenite answers pings itself. A close frame is followed by
            // the end of the stream.
            let frames = ws_stream.filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(anyhow!(e).context("kline WebSocket read error"))),
                }
            });

            Ok(frames.boxed())
        }
        .boxed()
    }
}

// =============================================================================
// Events
// =============================================================================

/// What a connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Handshake completed; the subscription is live.
    Opened { generation: u64 },
    /// A closed kline was normalized.
    Candle {
        generation: u64,
        symbol: String,
        candle: Candle,
    },
    /// Connect failed, timed out, or the stream dropped.
    TransportFailure { generation: u64, reason: String },
}

impl StreamEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Opened { generation }
            | Self::Candle { generation, .. }
            | Self::TransportFailure { generation, .. } => *generation,
        }
    }
}

// =============================================================================
// StreamConnection
// =============================================================================

pub struct StreamConnection {
    transport: Arc<dyn KlineTransport>,
    base_url: String,
    connect_timeout: Option<Duration>,
    state: Arc<RwLock<ConnectionState>>,
    subscription: Option<(Selection, u64)>,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    pub fn new(
        transport: Arc<dyn KlineTransport>,
        base_url: impl Into<String>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            connect_timeout,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            subscription: None,
            task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Selection of the current (or last) subscription.
    pub fn selection(&self) -> Option<&Selection> {
        self.subscription.as_ref().map(|(sel, _)| sel)
    }

    #[cfg(test)]
    pub fn generation(&self) -> Option<u64> {
        self.subscription.as_ref().map(|(_, generation)| *generation)
    }

    /// Whether a subscription is being established or is live.
    pub fn is_live(&self) -> bool {
        matches!(self.state(), ConnectionState::Connecting | ConnectionState::Open)
    }

    pub fn stream_url(&self, selection: &Selection) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            selection.stream_name()
        )
    }

    /// Subscribe to `selection`'s kline channel. Any live subscription is
    /// closed first. Must be called from within a tokio runtime.
    pub fn open(
        &mut self,
        selection: Selection,
        generation: u64,
        events: UnboundedSender<StreamEvent>,
    ) {
        if self.task.is_some() {
            self.close();
        }

        if !SUPPORTED_INTERVALS.contains(&selection.interval.as_str()) {
            warn!(
                interval = %selection.interval,
                "unsupported kline interval requested -- it will still be subscribed"
            );
        }

        let url = self.stream_url(&selection);
        info!(url = %url, selection = %selection, generation, "opening kline stream");

        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        self.state = state.clone();

        let reader = StreamReader {
            transport: self.transport.clone(),
            url,
            connect_timeout: self.connect_timeout,
            symbol: selection.symbol.clone(),
            generation,
            state,
            events,
        };
        self.task = Some(tokio::spawn(reader.run()));
        self.subscription = Some((selection, generation));
    }

    /// Release the transport. Idempotent; valid from any state.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let previous = std::mem::replace(&mut *self.state.write(), ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            info!(
                selection = ?self.selection().map(ToString::to_string),
                from = %previous,
                "kline stream closed"
            );
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// Reader task
// =============================================================================

struct StreamReader {
    transport: Arc<dyn KlineTransport>,
    url: String,
    connect_timeout: Option<Duration>,
    symbol: String,
    generation: u64,
    state: Arc<RwLock<ConnectionState>>,
    events: UnboundedSender<StreamEvent>,
}

impl StreamReader {
    async fn run(self) {
        let reason = match self.pump().await {
            Ok(()) => "kline stream ended".to_string(),
            Err(e) => format!("{e:#}"),
        };

        *self.state.write() = ConnectionState::Closed;
        let err = PipelineError::TransportFailure(reason.clone());
        warn!(
            symbol = %self.symbol,
            generation = self.generation,
            error = %err,
            "kline stream lost"
        );
        let _ = self.events.send(StreamEvent::TransportFailure {
            generation: self.generation,
            reason,
        });
    }

    async fn pump(&self) -> Result<()> {
        let connect = self.transport.connect(self.url.clone());
        let mut frames = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| anyhow!("connect timed out after {limit:?}"))??,
            None => connect.await?,
        };

        *self.state.write() = ConnectionState::Open;
        info!(symbol = %self.symbol, generation = self.generation, "kline stream connected");
        if self
            .events
            .send(StreamEvent::Opened {
                generation: self.generation,
            })
            .is_err()
        {
            return Ok(());
        }

        while let Some(frame) = frames.next().await {
            let text = frame?;
            match normalize(&text) {
                Ok(candle) => {
                    debug!(
                        symbol = %self.symbol,
                        time = candle.time,
                        close = candle.close,
                        "closed candle received"
                    );
                    let event = StreamEvent::Candle {
                        generation: self.generation,
                        symbol: self.symbol.clone(),
                        candle,
                    };
                    if self.events.send(event).is_err() {
                        return Ok(());
                    }
                }
                Err(Rejected::InProgress { time }) => {
                    trace!(symbol = %self.symbol, time, "in-progress kline skipped");
                }
                Err(rejected) => {
                    if let Some(err) = rejected.into_error() {
                        warn!(symbol = %self.symbol, error = %err, "dropping kline frame");
                    }
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub use scripted::ScriptedTransport;
