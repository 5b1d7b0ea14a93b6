// =============================================================================
// Coordinator — selection changes, live candles, reconnect policy
// =============================================================================
//
// One task owns the HistoryStore, the StreamConnection and the Selection.
// Everything that mutates them arrives through `run()`'s select loop:
//   1. selection commands from the controls (REST / WebSocket),
//   2. events from the current kline connection,
//   3. the pending reconnect timer.
// Steps never overlap, so at most one candle is processed at a time and a
// connection swap (close, then open) is atomic with respect to candle
// delivery. Events from a superseded connection generation are discarded.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::error::PipelineError;
use crate::history::HistoryStore;
use crate::market_data::{Candle, StreamConnection, StreamEvent};
use crate::projection::{project, ProjectedSeries};
use crate::runtime_config::ReconnectPolicy;
use crate::types::{canonical_symbol, Selection, WarningKind};

/// Selection events consumed by the Coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ChangeSymbol(String),
    ChangeInterval(String),
    Shutdown,
}

enum Step {
    Command(Option<Command>),
    Stream(StreamEvent),
    Retry,
}

pub struct Coordinator {
    store: HistoryStore,
    connection: StreamConnection,
    selection: Selection,
    view: ProjectedSeries,

    /// Generation of the connection whose events are accepted.
    generation: u64,
    events_tx: UnboundedSender<StreamEvent>,
    events_rx: UnboundedReceiver<StreamEvent>,

    reconnect: ReconnectPolicy,
    /// Consecutive transport failures since the stream last proved healthy.
    failures: u32,
    retry_at: Option<Instant>,
    /// When the current connection completed its handshake.
    opened_at: Option<Instant>,

    shared: Arc<AppState>,
}

impl Coordinator {
    pub fn new(
        store: HistoryStore,
        connection: StreamConnection,
        selection: Selection,
        reconnect: ReconnectPolicy,
        shared: Arc<AppState>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            connection,
            selection,
            view: ProjectedSeries::default(),
            generation: 0,
            events_tx,
            events_rx,
            reconnect,
            failures: 0,
            retry_at: None,
            opened_at: None,
            shared,
        }
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    #[cfg(test)]
    pub fn active_view(&self) -> &ProjectedSeries {
        &self.view
    }

    #[cfg(test)]
    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    #[cfg(test)]
    pub fn connection_state(&self) -> crate::types::ConnectionState {
        self.connection.state()
    }

    // ── Selection ───────────────────────────────────────────────────────

    /// Project the initial selection and subscribe to it.
    pub fn start(&mut self) {
        info!(selection = %self.selection, "coordinator starting");
        self.refresh_view();
        self.shared.publish_selection(&self.selection);
        self.open_current();
    }

    /// Switch to a new (symbol, interval): close the old connection, show
    /// the stored series for the new symbol, open the new connection.
    pub fn select(&mut self, selection: Selection) {
        if selection == self.selection && self.connection.is_live() {
            debug!(selection = %selection, "selection unchanged");
            return;
        }

        info!(from = %self.selection, to = %selection, "selection changed");

        self.connection.close();
        self.retry_at = None;
        self.failures = 0;
        self.opened_at = None;

        self.selection = selection;
        self.refresh_view();
        self.shared.publish_selection(&self.selection);

        self.open_current();
    }

    /// Returns `false` when the loop should stop.
    pub fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ChangeSymbol(symbol) => {
                let next = self.selection.with_symbol(&symbol);
                self.select(next);
            }
            Command::ChangeInterval(interval) => {
                let next = self.selection.with_interval(&interval);
                self.select(next);
            }
            Command::Shutdown => return false,
        }
        true
    }

    // ── Stream events ───────────────────────────────────────────────────

    pub async fn handle_stream_event(&mut self, event: StreamEvent) {
        if event.generation() != self.generation {
            debug!(
                stale = event.generation(),
                current = self.generation,
                "discarding event from superseded connection"
            );
            return;
        }

        match event {
            StreamEvent::Opened { .. } => {
                // The failure count survives the handshake; a stream that
                // drops right after opening still counts towards the limit.
                self.opened_at = Some(Instant::now());
            }
            StreamEvent::Candle { symbol, candle, .. } => {
                if self.failures > 0 {
                    info!(
                        selection = %self.selection,
                        failures = self.failures,
                        "kline stream recovered"
                    );
                    self.failures = 0;
                }
                self.on_candle(&symbol, candle).await;
            }
            StreamEvent::TransportFailure { reason, .. } => self.on_transport_failure(reason),
        }

        self.shared.publish_connection_state(self.connection.state());
    }

    async fn on_candle(&mut self, symbol: &str, candle: Candle) {
        match self.store.append(symbol, candle).await {
            Ok(()) => {}
            Err(err @ PipelineError::PersistenceFailure(_)) => {
                warn!(error = %err, "candle kept in memory only");
                self.shared.push_warning(WarningKind::Persistence, err.to_string());
            }
            Err(err) => {
                warn!(error = %err, user_visible = err.is_user_visible(), "dropping candle");
                return;
            }
        }

        // Durability does not depend on focus: the candle is stored even if
        // its symbol is not the one on screen.
        if canonical_symbol(symbol) == self.selection.symbol {
            self.refresh_view();
        }
    }

    fn on_transport_failure(&mut self, reason: String) {
        let stable = self
            .opened_at
            .take()
            .is_some_and(|at| at.elapsed() >= self.reconnect.stable_after());
        if stable {
            self.failures = 0;
        }
        self.failures += 1;
        let err = PipelineError::TransportFailure(reason);

        if self.reconnect.allows(self.failures) {
            let delay = self.reconnect.delay_for(self.failures);
            warn!(
                selection = %self.selection,
                attempt = self.failures,
                max_retries = self.reconnect.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "kline stream lost -- scheduling reconnect"
            );
            self.shared.push_warning(
                WarningKind::Transport,
                format!(
                    "{err}; reconnecting to {} in {} ms (attempt {}/{})",
                    self.selection,
                    delay.as_millis(),
                    self.failures,
                    self.reconnect.max_retries
                ),
            );
            self.retry_at = Some(Instant::now() + delay);
        } else {
            error!(
                selection = %self.selection,
                failures = self.failures,
                error = %err,
                "kline stream lost -- giving up"
            );
            self.shared.push_warning(
                WarningKind::Transport,
                format!(
                    "{err}; gave up on {} after {} attempts",
                    self.selection, self.failures
                ),
            );
            self.retry_at = None;
        }
    }

    /// Re-open the current selection after a transport failure.
    pub fn reconnect_now(&mut self) {
        self.retry_at = None;
        info!(
            selection = %self.selection,
            attempt = self.failures,
            "reconnecting kline stream"
        );
        self.open_current();
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn open_current(&mut self) {
        self.generation += 1;
        self.connection
            .open(self.selection.clone(), self.generation, self.events_tx.clone());
        self.shared.publish_connection_state(self.connection.state());
    }

    fn refresh_view(&mut self) {
        self.view = project(&self.store.get_series(&self.selection.symbol));
        if self.view.is_empty() {
            debug!(symbol = %self.selection.symbol, "no stored history for symbol");
        } else {
            debug!(symbol = %self.selection.symbol, points = self.view.len(), "series projected");
        }
        self.shared.publish_view(self.view.clone());
    }

    // ── Event loop ──────────────────────────────────────────────────────

    /// Drive the pipeline until `Shutdown` arrives or the command channel
    /// closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.start();

        loop {
            let retry_at = self.retry_at;
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                Some(event) = self.events_rx.recv() => Step::Stream(event),
                () = retry_timer(retry_at) => Step::Retry,
            };

            match step {
                Step::Command(Some(command)) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Step::Command(None) => break,
                Step::Stream(event) => self.handle_stream_event(event).await,
                Step::Retry => self.reconnect_now(),
            }
        }

        self.connection.close();
        self.shared.publish_connection_state(self.connection.state());
        info!(candles = self.store.candle_count(), "coordinator stopped");
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
