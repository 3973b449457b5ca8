// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under the configured base path (default `/api/v1`).
// `/health` is public; everything else goes through the AuthBearer
// extractor.  CORS is permissive for dashboard development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::indicators::FIELD_HINTS;
use crate::strategy::StrategyCommand;

/// Default page size for trades / ledger / equity windows.
const DEFAULT_PAGE_LIMIT: usize = 100;

/// Hard cap on any requested window.
const MAX_PAGE_LIMIT: usize = 1_000;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/strategies", get(strategies))
        .route("/status", get(status))
        .route("/klines", get(klines))
        .route("/indicators", get(indicators))
        .route("/trades", get(trades))
        .route("/ledger", get(ledger))
        .route("/equity", get(equity))
        .route("/conditions", get(conditions))
        .route("/db/reset", post(db_reset))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler));

    let base = state.config.api.base_path.trim_end_matches('/').to_string();
    let router = if base.is_empty() {
        api
    } else {
        Router::new().nest(&base, api)
    };

    router.layer(cors).with_state(state)
}

// =============================================================================
// Query shapes
// =============================================================================

#[derive(Deserialize)]
struct StrategyQuery {
    strategy: Option<String>,
}

#[derive(Deserialize)]
struct KlinesQuery {
    interval: String,
    #[serde(default)]
    limit: Option<usize>,
    /// When set, return just the bar with this open_time.
    #[serde(default)]
    open_time: Option<i64>,
}

#[derive(Deserialize)]
struct IndicatorQuery {
    strategy: Option<String>,
    interval: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct PageQuery {
    strategy: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Deserialize)]
struct ResetQuery {
    strategy: String,
}

fn page_bounds(q: &PageQuery) -> (usize, usize) {
    (
        q.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT),
        q.offset.unwrap_or(0),
    )
}

fn unknown_strategy() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "unknown strategy" })),
    )
}

fn db_error(e: rusqlite::Error) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %e, "query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "storage query failed" })),
    )
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let intervals: serde_json::Map<String, serde_json::Value> = state
        .config
        .intervals
        .iter()
        .map(|iv| {
            let stored = state
                .dao
                .dao()
                .kline_count(&state.config.symbol, iv)
                .unwrap_or(0);
            (
                iv.clone(),
                serde_json::json!({
                    "buffered": state.buffer.count(iv),
                    "tail_open_time": state.buffer.tail_open_time(iv),
                    "stored": stored,
                }),
            )
        })
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "symbol": state.config.symbol,
        "conn_state": state.source.state().to_string(),
        "source_degraded": state.source.is_degraded(),
        "storage_memory_only": state.dao.dao().is_memory_only(),
        "subscribers": state.fanout.subscriber_count(),
        "intervals": intervals,
        "uptime_secs": state.uptime_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Strategies
// =============================================================================

async fn strategies(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let list: Vec<serde_json::Value> = state
        .strategies
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "type": s.strategy_type,
                "quarantined": *s.quarantined.read(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "strategies": list,
        "default": state.config.default_strategy,
    }))
}

// =============================================================================
// Status
// =============================================================================

async fn status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<StrategyQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let shared = state
        .strategy_or_default(q.strategy.as_deref())
        .ok_or_else(unknown_strategy)?;
    Ok(Json(shared.status.read().clone()))
}

// =============================================================================
// Klines
// =============================================================================

async fn klines(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<KlinesQuery>,
) -> impl IntoResponse {
    if let Some(open_time) = q.open_time {
        let bar = state.buffer.get(&q.interval, open_time);
        return Json(bar.into_iter().collect::<Vec<_>>());
    }
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
    let bars = state.buffer.last_closed(&q.interval, limit);
    Json(bars)
}

// =============================================================================
// Indicator history
// =============================================================================

async fn indicators(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<IndicatorQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let shared = state
        .strategy_or_default(q.strategy.as_deref())
        .ok_or_else(unknown_strategy)?;

    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
    let snapshots = shared.history_last(&q.interval, limit);

    let hints: serde_json::Map<String, serde_json::Value> = FIELD_HINTS
        .iter()
        .map(|(name, hint)| {
            (
                (*name).to_string(),
                serde_json::to_value(hint).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();

    Ok(Json(serde_json::json!({
        "strategy": shared.id,
        "interval": q.interval,
        "snapshots": snapshots,
        "hints": hints,
    })))
}

// =============================================================================
// Trades / Ledger / Equity (paginated, newest first)
// =============================================================================

async fn trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PageQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let shared = state
        .strategy_or_default(q.strategy.as_deref())
        .ok_or_else(unknown_strategy)?;
    let (limit, offset) = page_bounds(&q);
    let rows = state
        .dao
        .dao()
        .trades_page(&shared.id, limit, offset)
        .map_err(db_error)?;
    Ok(Json(rows))
}

async fn ledger(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PageQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let shared = state
        .strategy_or_default(q.strategy.as_deref())
        .ok_or_else(unknown_strategy)?;
    let (limit, offset) = page_bounds(&q);
    let rows = state
        .dao
        .dao()
        .ledger_page(&shared.id, limit, offset)
        .map_err(db_error)?;
    Ok(Json(rows))
}

async fn equity(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PageQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let shared = state
        .strategy_or_default(q.strategy.as_deref())
        .ok_or_else(unknown_strategy)?;
    let (limit, offset) = page_bounds(&q);
    let rows = state
        .dao
        .dao()
        .equity_page(&shared.id, limit, offset)
        .map_err(db_error)?;
    Ok(Json(rows))
}

// =============================================================================
// Condition summary
// =============================================================================

async fn conditions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<StrategyQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let shared = state
        .strategy_or_default(q.strategy.as_deref())
        .ok_or_else(unknown_strategy)?;
    let checklist = shared.checklist.read().clone();
    Ok(Json(serde_json::json!({
        "strategy": shared.id,
        "checklist": checklist,
    })))
}

// =============================================================================
// DB reset (destructive, scoped by strategy)
// =============================================================================

async fn db_reset(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ResetQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let shared = state.strategy(&q.strategy).ok_or_else(unknown_strategy)?;

    if !shared.send_command(StrategyCommand::Reset) {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "strategy task is not running" })),
        ));
    }

    info!(strategy = %q.strategy, "strategy reset requested via API");
    Ok(Json(serde_json::json!({
        "strategy": q.strategy,
        "message": "reset scheduled",
    })))
}
