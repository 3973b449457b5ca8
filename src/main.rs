// =============================================================================
// Vela Paper Engine — Main Entry Point
// =============================================================================
//
// Startup order matters: strategy tasks subscribe to the bar broadcast
// before REST warmup runs, so the warmup commits seed every indicator set
// incrementally.  Live streaming starts only after warmup; the first gap
// repair covers whatever closed between the warmup fetch and the socket
// coming up.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod api;
mod app_state;
mod binance;
mod error;
mod fanout;
mod indicators;
mod market_data;
mod runtime_config;
mod sim;
mod store;
mod strategy;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertHub;
use crate::app_state::AppState;
use crate::fanout::{FanoutHub, PushInterval};
use crate::market_data::source::MarketSource;
use crate::market_data::KlineBuffer;
use crate::runtime_config::RuntimeConfig;
use crate::store::dao::RESUME_MARKER_KEY;
use crate::store::{Dao, DaoHandle};
use crate::strategy::StrategyInstance;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Vela Paper Engine — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("VELA_CONFIG").unwrap_or_else(|_| "runtime_config.json".into());
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = RuntimeConfig::default();
        // Leave a template behind so the next edit starts from real keys.
        if let Err(e) = defaults.save(&config_path) {
            warn!(error = %e, "could not write default config template");
        }
        defaults
    });

    info!(
        symbol = %config.symbol,
        intervals = ?config.intervals,
        strategies = config.strategies.len(),
        "Engine configured"
    );

    // ── 2. Alerts ────────────────────────────────────────────────────────
    let alerts = AlertHub::new(&config.alerts);

    // ── 3. Storage ───────────────────────────────────────────────────────
    let dao = match Dao::open(&config.db.path) {
        Ok(dao) => dao,
        Err(e) => {
            error!(error = %e, path = %config.db.path, "Failed to open database — running memory-only");
            alerts.raise("storage_failed", format!("database unavailable at startup: {e}"));
            Dao::open_in_memory()?
        }
    };
    let dao_handle = DaoHandle::spawn(dao, alerts.clone());
    alerts.set_store(dao_handle.clone());

    // Record the restart discontinuity: ticks missed while down are not
    // simulated.
    if let Ok(Some(prev)) = dao_handle.dao().get_state(RESUME_MARKER_KEY) {
        info!(previous_marker_ms = %prev, "resuming after downtime; missed ticks are not replayed");
    }
    let boot_ms = chrono::Utc::now().timestamp_millis();
    dao_handle.put_state(RESUME_MARKER_KEY, boot_ms.to_string());

    // ── 4. Market data plumbing ──────────────────────────────────────────
    let buffer = Arc::new(KlineBuffer::new(config.buffer_capacity()));
    let fanout = Arc::new(FanoutHub::new(
        PushInterval::parse(&config.api.ws_push_interval).unwrap_or(PushInterval::Raw),
    ));

    let source = Arc::new(MarketSource::new(
        config.symbol.clone(),
        config.intervals.clone(),
        config.warmup_bars(),
        config.exchange.rest_base_url.clone(),
        config.exchange.ws_base_url.clone(),
        buffer.clone(),
        dao_handle.clone(),
        alerts.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // ── 5. Strategy instances (subscribe before warmup) ──────────────────
    let mut strategy_shared = Vec::new();
    let mut strategy_tasks = Vec::new();

    for inst_cfg in &config.strategies {
        let (mut instance, shared, cmd_rx) = StrategyInstance::new(
            &config,
            inst_cfg,
            buffer.clone(),
            dao_handle.clone(),
            fanout.clone(),
            alerts.clone(),
        );

        // Restart recovery: latest persisted balance, then any OPEN position.
        match dao_handle.dao().equity_page(&inst_cfg.id, 1, 0) {
            Ok(snaps) => {
                if let Some(latest) = snaps.first() {
                    instance.restore_balance(latest.balance);
                }
            }
            Err(e) => warn!(strategy = %inst_cfg.id, error = %e, "balance recovery failed"),
        }
        match dao_handle.dao().open_positions(&inst_cfg.id) {
            Ok(open) => {
                for position in open {
                    instance.restore_position(position);
                }
            }
            Err(e) => warn!(strategy = %inst_cfg.id, error = %e, "position recovery failed"),
        }

        strategy_shared.push(shared);

        let events = source.subscribe();
        strategy_tasks.push(tokio::spawn(strategy::run_instance(
            instance,
            events,
            cmd_rx,
            shutdown_rx.clone(),
        )));
    }

    info!(count = strategy_tasks.len(), "Strategy tasks launched");

    // ── 6. API server ────────────────────────────────────────────────────
    let state = Arc::new(AppState {
        config: config.clone(),
        buffer: buffer.clone(),
        dao: dao_handle.clone(),
        fanout: fanout.clone(),
        source: source.clone(),
        strategies: strategy_shared,
        start_time: std::time::Instant::now(),
    });

    let bind_addr = format!("{}:{}", config.api.host, config.api.port);
    {
        let app = api::rest::router(state.clone());
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        info!(addr = %bind_addr, "API server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    // ── 7. Warmup, then live streaming ───────────────────────────────────
    if let Err(e) = source.warmup().await {
        warn!(error = %e, "warmup incomplete — gap repair will reconcile");
        alerts.raise("warmup_failed", format!("REST warmup incomplete: {e}"));
    }

    let source_task = tokio::spawn(source.clone().run(shutdown_rx.clone()));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);

    // Let the source stop producing, strategies drain their channels, and
    // the DAO writer flush what is queued.
    let drain = async {
        let _ = source_task.await;
        for task in strategy_tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(10), drain)
        .await
        .is_err()
    {
        warn!("shutdown drain timed out");
    }

    dao_handle.put_state(RESUME_MARKER_KEY, chrono::Utc::now().timestamp_millis().to_string());
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    info!("Vela Paper Engine shut down complete.");
    Ok(())
}
