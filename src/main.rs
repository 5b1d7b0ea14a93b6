// =============================================================================
// Candle Feed — Main Entry Point
// =============================================================================
//
// Streams closed Binance klines for one (symbol, interval) at a time, keeps a
// persisted per-symbol close-price history and serves the projected series
// for the selected symbol over REST and WebSocket.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod coordinator;
mod error;
mod history;
mod market_data;
mod projection;
mod runtime_config;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::coordinator::{Command, Coordinator};
use crate::history::{FileStorage, HistoryStore};
use crate::market_data::{StreamConnection, TungsteniteTransport};
use crate::runtime_config::RuntimeConfig;
use crate::types::Selection;

const CONFIG_PATH: &str = "candle_feed.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Feed starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    let selection = Selection::new(&config.symbol, &config.interval);
    info!(
        selection = %selection,
        history = %config.history_path,
        stream = %config.stream_base_url,
        "Configured candle feed"
    );

    // ── 2. History ───────────────────────────────────────────────────────
    let storage = FileStorage::new(&config.history_path);
    let store = HistoryStore::load(Arc::new(storage), config.max_candles_per_symbol);
    info!(
        symbols = store.symbols().count(),
        candles = store.candle_count(),
        "History loaded"
    );

    // ── 3. Shared state & coordinator ────────────────────────────────────
    let (commands_tx, commands_rx) = mpsc::channel::<Command>(64);
    let state = Arc::new(AppState::new(&config, selection.clone(), commands_tx.clone()));

    let connection = StreamConnection::new(
        Arc::new(TungsteniteTransport),
        config.stream_base_url.clone(),
        config.connect_timeout(),
    );
    let coordinator = Coordinator::new(
        store,
        connection,
        selection,
        config.reconnect.clone(),
        state.clone(),
    );
    let coordinator_task = tokio::spawn(coordinator.run(commands_rx));

    // ── 4. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received -- stopping gracefully");

    if commands_tx.send(Command::Shutdown).await.is_err() {
        warn!("Coordinator already stopped");
    }
    if let Err(e) = coordinator_task.await {
        error!(error = %e, "Coordinator task failed");
    }

    info!("Candle Feed shut down complete.");
    Ok(())
}
