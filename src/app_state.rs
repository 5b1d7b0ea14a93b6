// =============================================================================
// Shared Application State — read side of the candle feed
// =============================================================================
//
// The Coordinator owns the pipeline (history, connection, selection) and
// publishes what the outside world may see into this struct after every
// step. API handlers only read it, plus forward selection requests to the
// Coordinator through `commands`.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for all published values.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::coordinator::Command;
use crate::projection::ProjectedSeries;
use crate::runtime_config::RuntimeConfig;
use crate::types::{ConnectionState, Selection, WarningKind};

/// Maximum number of recent warnings to retain.
const MAX_RECENT_WARNINGS: usize = 50;

// =============================================================================
// Warning Record
// =============================================================================

/// A non-blocking, user-visible warning.
#[derive(Debug, Clone, Serialize)]
pub struct WarningRecord {
    pub kind: WarningKind,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Serializable view of everything the renderer and controls need.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub selection: Selection,
    pub connection_state: ConnectionState,
    pub series: ProjectedSeries,
    pub labels: Vec<String>,
    pub warnings: Vec<WarningRecord>,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    /// Incremented on every published change; the WebSocket feed uses it to
    /// detect when to push.
    pub state_version: AtomicU64,

    pub selection: RwLock<Selection>,
    pub connection_state: RwLock<ConnectionState>,
    pub active_view: RwLock<ProjectedSeries>,
    pub recent_warnings: RwLock<Vec<WarningRecord>>,

    /// Choices offered to the selection controls.
    pub symbols: Vec<String>,
    pub intervals: Vec<String>,

    /// Selection events into the Coordinator.
    pub commands: mpsc::Sender<Command>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: &RuntimeConfig,
        selection: Selection,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            selection: RwLock::new(selection),
            connection_state: RwLock::new(ConnectionState::Disconnected),
            active_view: RwLock::new(ProjectedSeries::default()),
            recent_warnings: RwLock::new(Vec::new()),
            symbols: config.symbols.clone(),
            intervals: config.intervals.clone(),
            commands,
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Publishing (Coordinator side) ───────────────────────────────────

    pub fn publish_selection(&self, selection: &Selection) {
        *self.selection.write() = selection.clone();
        self.increment_version();
    }

    /// Version is only bumped on an actual state change.
    pub fn publish_connection_state(&self, state: ConnectionState) {
        let mut current = self.connection_state.write();
        if *current != state {
            *current = state;
            drop(current);
            self.increment_version();
        }
    }

    pub fn publish_view(&self, view: ProjectedSeries) {
        *self.active_view.write() = view;
        self.increment_version();
    }

    /// Record a warning. The list is capped at [`MAX_RECENT_WARNINGS`];
    /// oldest entries are evicted first.
    pub fn push_warning(&self, kind: WarningKind, message: String) {
        let record = WarningRecord {
            kind,
            message,
            at: Utc::now().to_rfc3339(),
        };

        let mut warnings = self.recent_warnings.write();
        warnings.push(record);
        while warnings.len() > MAX_RECENT_WARNINGS {
            warnings.remove(0);
        }
        drop(warnings);

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    pub fn build_snapshot(&self) -> ChartSnapshot {
        let series = self.active_view.read().clone();
        let labels = series.labels();
        ChartSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            selection: self.selection.read().clone(),
            connection_state: *self.connection_state.read(),
            series,
            labels,
            warnings: self.recent_warnings.read().clone(),
        }
    }
}
