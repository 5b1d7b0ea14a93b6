// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Reads come straight from the published
// AppState; selection changes are forwarded to the Coordinator as commands
// and acknowledged with `202 Accepted` before they are applied.
//
// CORS is configured permissively so a local chart page can poll the feed.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::coordinator::Command;
use crate::types::{canonical_symbol, ConnectionState, Selection};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/series", get(series))
        .route("/api/v1/selection", get(get_selection).post(set_selection))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    connection_state: ConnectionState,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
        connection_state: *state.connection_state.read(),
    };
    Json(resp)
}

// =============================================================================
// Full state snapshot
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Projected series for the renderer
// =============================================================================

#[derive(Serialize)]
struct SeriesResponse {
    symbol: String,
    interval: String,
    timestamps: Vec<i64>,
    prices: Vec<f64>,
    labels: Vec<String>,
}

async fn series(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let selection = state.selection.read().clone();
    let view = state.active_view.read().clone();
    let labels = view.labels();
    Json(SeriesResponse {
        symbol: selection.symbol,
        interval: selection.interval,
        timestamps: view.timestamps,
        prices: view.prices,
        labels,
    })
}

// =============================================================================
// Selection
// =============================================================================

#[derive(Serialize)]
struct SelectionResponse {
    selection: Selection,
    symbols: Vec<String>,
    intervals: Vec<String>,
}

async fn get_selection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(SelectionResponse {
        selection: state.selection.read().clone(),
        symbols: state.symbols.clone(),
        intervals: state.intervals.clone(),
    })
}

/// Body of a selection change. Omitted fields keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct SelectionRequest {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
}

impl SelectionRequest {
    /// Validate the request and turn it into Coordinator commands. Symbols
    /// must be one of `offered`; Binance silently sends nothing for unknown
    /// pairs.
    pub fn into_commands(self, offered: &[String]) -> Result<Vec<Command>, String> {
        let mut commands = Vec::new();

        if let Some(symbol) = self.symbol {
            if symbol.trim().is_empty() {
                return Err("symbol must not be empty".to_string());
            }
            let wanted = canonical_symbol(&symbol);
            if !offered.iter().any(|s| canonical_symbol(s) == wanted) {
                return Err(format!("unknown symbol `{wanted}`; expected one of {offered:?}"));
            }
            commands.push(Command::ChangeSymbol(symbol));
        }
        if let Some(interval) = self.interval {
            if interval.trim().is_empty() {
                return Err("interval must not be empty".to_string());
            }
            commands.push(Command::ChangeInterval(interval));
        }

        if commands.is_empty() {
            return Err("expected `symbol` and/or `interval`".to_string());
        }
        Ok(commands)
    }
}

/// Forward a selection request to the Coordinator.
pub async fn submit_selection(
    state: &AppState,
    request: SelectionRequest,
) -> Result<(), (StatusCode, String)> {
    let commands = request
        .into_commands(&state.symbols)
        .map_err(|msg| {
            warn!(error = %msg, "selection request rejected");
            (StatusCode::BAD_REQUEST, msg)
        })?;

    for command in commands {
        info!(command = ?command, "selection change requested");
        if state.commands.send(command).await.is_err() {
            warn!("coordinator is not running -- selection change dropped");
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "coordinator is not running".to_string(),
            ));
        }
    }
    Ok(())
}

async fn set_selection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SelectionRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    submit_selection(&state, req)
        .await
        .map_err(|(status, msg)| (status, Json(serde_json::json!({ "error": msg }))))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    ))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::market_data::Candle;
    use crate::projection::project;
    use crate::runtime_config::RuntimeConfig;

    fn app() -> (Arc<AppState>, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(8);
        let state = Arc::new(AppState::new(
            &RuntimeConfig::default(),
            Selection::new("ETHUSDT", "1m"),
            tx,
        ));
        (state, rx)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_selection(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/v1/selection")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, _rx) = app();
        let resp = router(state)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connection_state"], "Disconnected");
    }

    #[tokio::test]
    async fn series_returns_the_published_view() {
        let (state, _rx) = app();
        state.publish_view(project(&[
            Candle::new(60_000, 1.0, 2.0, 0.5, 1.5),
            Candle::new(120_000, 1.5, 2.5, 1.0, 2.0),
        ]));

        let resp = router(state)
            .oneshot(Request::get("/api/v1/series").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["symbol"], "ETHUSDT");
        assert_eq!(json["timestamps"], serde_json::json!([60_000, 120_000]));
        assert_eq!(json["prices"], serde_json::json!([1.5, 2.0]));
        assert_eq!(json["labels"][0], "1970-01-01T00:01:00Z");
    }

    #[tokio::test]
    async fn get_selection_lists_offered_choices() {
        let (state, _rx) = app();
        let resp = router(state)
            .oneshot(Request::get("/api/v1/selection").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["selection"]["symbol"], "ETHUSDT");
        assert_eq!(json["symbols"], serde_json::json!(["ETHUSDT", "BNBUSDT", "DOTUSDT"]));
        assert_eq!(json["intervals"], serde_json::json!(["1m", "5m", "15m"]));
    }

    #[tokio::test]
    async fn post_selection_forwards_commands() {
        let (state, mut rx) = app();
        let resp = router(state)
            .oneshot(post_selection(r#"{"symbol":"bnbusdt","interval":"5m"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await, Some(Command::ChangeSymbol("bnbusdt".into())));
        assert_eq!(rx.recv().await, Some(Command::ChangeInterval("5m".into())));
    }

    #[tokio::test]
    async fn post_selection_rejects_empty_requests() {
        let (state, mut rx) = app();
        for body in [r#"{}"#, r#"{"symbol":"  "}"#, r#"{"interval":""}"#] {
            let resp = router(state.clone()).oneshot(post_selection(body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn post_selection_rejects_symbols_outside_the_offered_list() {
        let (state, mut rx) = app();
        let resp = router(state)
            .oneshot(post_selection(r#"{"symbol":"ETHUSTD","interval":"5m"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("ETHUSTD"), "{json}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn post_selection_without_coordinator_is_unavailable() {
        let (state, rx) = app();
        drop(rx);
        let resp = router(state)
            .oneshot(post_selection(r#"{"symbol":"DOTUSDT"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn state_snapshot_includes_selection_and_warnings() {
        let (state, _rx) = app();
        state.push_warning(crate::types::WarningKind::Transport, "stream lost".into());
        let resp = router(state)
            .oneshot(Request::get("/api/v1/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["selection"]["interval"], "1m");
        assert_eq!(json["warnings"][0]["message"], "stream lost");
        assert_eq!(json["warnings"][0]["kind"], "Transport");
    }
}
