// =============================================================================
// Market Source — REST warmup + live kline WebSocket with gap repair
// =============================================================================
//
// Two sub-protocols feed one bar event stream:
//
//   * Warmup: page the last W bars per interval over REST, emit them as
//     commit events (source=warmup), persist idempotently.
//   * Live: one multiplexed combined-stream WebSocket for all intervals.
//     closed=false frames become preview events (never persisted),
//     closed=true frames become commit events.
//
// Connection lifecycle:
//
//   Disconnected -> Connecting -> Handshaking -> Streaming -> Reconnecting
//
// Any transport failure or 60 s of silence tears the socket down; reconnects
// back off exponentially with jitter, capped at 30 s.  Before re-entering
// Streaming a gap repair REST-fetches (tail_open_time, now] per interval and
// emits the missed bars as commits.  Three consecutive repair failures mark
// the source degraded; the engine keeps serving stale state.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertHub;
use crate::binance::client::{parse_string_f64, BinanceClient};
use crate::error::EngineError;
use crate::market_data::{interval_ms, Bar, BarEvent, KlineBuffer};
use crate::store::DaoHandle;
use crate::types::BarSource;

/// Reconnect backoff cap.
const BACKOFF_CAP_MS: u64 = 30_000;

/// Base reconnect delay (doubled per consecutive failure).
const BACKOFF_BASE_MS: u64 = 500;

/// Idle heartbeat: no frame for this long forces a reconnect.
const IDLE_TIMEOUT_SECS: u64 = 60;

/// Consecutive gap-repair failures before the source is marked degraded.
const MAX_REPAIR_FAILURES: u32 = 3;

/// Connection state, exposed on the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
    Reconnecting,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Streaming => write!(f, "streaming"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// The market source owns the upstream connections and is the only producer
/// of bar events.  Buffer updates happen here, before the broadcast, so
/// every strategy observes identical bar values.
pub struct MarketSource {
    symbol: String,
    intervals: Vec<String>,
    warmup_bars: usize,
    ws_base_url: String,
    client: BinanceClient,
    buffer: Arc<KlineBuffer>,
    events: broadcast::Sender<BarEvent>,
    dao: DaoHandle,
    alerts: Arc<AlertHub>,
    state: RwLock<ConnState>,
    repair_failures: AtomicU32,
    degraded: RwLock<bool>,
}

impl MarketSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        intervals: Vec<String>,
        warmup_bars: usize,
        rest_base_url: String,
        ws_base_url: String,
        buffer: Arc<KlineBuffer>,
        dao: DaoHandle,
        alerts: Arc<AlertHub>,
    ) -> Self {
        let (events, _) = broadcast::channel(8_192);
        Self {
            symbol,
            intervals,
            warmup_bars,
            ws_base_url,
            client: BinanceClient::new(rest_base_url),
            buffer,
            events,
            dao,
            alerts,
            state: RwLock::new(ConnState::Disconnected),
            repair_failures: AtomicU32::new(0),
            degraded: RwLock::new(false),
        }
    }

    /// Subscribe to the bar event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BarEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn is_degraded(&self) -> bool {
        *self.degraded.read()
    }

    // -------------------------------------------------------------------------
    // Warmup
    // -------------------------------------------------------------------------

    /// One-shot REST warmup: fills the buffer, persists, and emits commit
    /// events so indicator engines seed incrementally.
    pub async fn warmup(&self) -> anyhow::Result<()> {
        for interval in &self.intervals {
            let bars = self
                .client
                .fetch_klines_back(&self.symbol, interval, self.warmup_bars)
                .await?;

            info!(
                symbol = %self.symbol,
                interval = %interval,
                count = bars.len(),
                "warmup bars fetched"
            );

            for bar in bars {
                self.ingest_commit(bar);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Live streaming
    // -------------------------------------------------------------------------

    /// Run the connection loop until shutdown.  `warmup()` must have
    /// completed first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if attempt > 0 {
                *self.state.write() = ConnState::Reconnecting;
                let delay = backoff_delay_ms(attempt);
                warn!(attempt, delay_ms = delay, "reconnecting after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                    _ = shutdown.changed() => break,
                }
            }

            match self.connect_and_stream(&mut shutdown).await {
                Ok(()) => {
                    // Clean shutdown requested.
                    break;
                }
                Err(e) => {
                    error!(error = %e, "kline stream error");
                    attempt = attempt.saturating_add(1);
                }
            }
        }

        *self.state.write() = ConnState::Disconnected;
        info!("market source stopped");
    }

    async fn connect_and_stream(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        *self.state.write() = ConnState::Connecting;

        let url = self.combined_stream_url();
        info!(url = %url, "connecting to kline WebSocket");

        let (ws_stream, _response) = connect_async(&url).await?;
        *self.state.write() = ConnState::Handshaking;
        info!("kline WebSocket connected");

        // Reconcile anything missed while disconnected before going live.
        self.gap_repair().await;

        *self.state.write() = ConnState::Streaming;
        let (_write, mut read) = ws_stream.split();

        loop {
            let next = tokio::select! {
                msg = tokio::time::timeout(
                    std::time::Duration::from_secs(IDLE_TIMEOUT_SECS),
                    read.next(),
                ) => msg,
                _ = shutdown.changed() => return Ok(()),
            };

            let msg = match next {
                Err(_) => {
                    return Err(EngineError::Transport(format!(
                        "no message for {IDLE_TIMEOUT_SECS}s, closing for reconnect"
                    )));
                }
                Ok(None) => {
                    return Err(EngineError::Transport("kline stream ended".into()));
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(msg))) => msg,
            };

            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                match parse_combined_kline(&text, &self.symbol) {
                    Ok(bar) => {
                        if bar.closed {
                            self.ingest_commit(bar);
                        } else {
                            self.ingest_preview(bar);
                        }
                    }
                    Err(e) => {
                        // Bad frames are dropped; the state machine does not
                        // advance.
                        warn!(error = %e, "failed to parse kline frame");
                    }
                }
            }
            // Ping/Pong/Binary/Close frames are handled by tungstenite.
        }
    }

    fn combined_stream_url(&self) -> String {
        let lower = self.symbol.to_lowercase();
        let streams: Vec<String> = self
            .intervals
            .iter()
            .map(|iv| format!("{lower}@kline_{iv}"))
            .collect();
        format!("{}/stream?streams={}", self.ws_base_url, streams.join("/"))
    }

    // -------------------------------------------------------------------------
    // Gap repair
    // -------------------------------------------------------------------------

    /// REST-fetch bars in `(tail_open_time, now]` for every interval and
    /// replay them as commits.  Idempotent: the DAO upserts on the natural
    /// key and the buffer replaces equal open_times.
    async fn gap_repair(self: &Arc<Self>) {
        let mut failed = false;

        for interval in &self.intervals {
            let Some(tail) = self.buffer.last_closed_open_time(interval) else {
                continue;
            };
            let Some(step) = interval_ms(interval) else {
                continue;
            };

            let start = tail + step;
            if start > BinanceClient::now_ms() {
                continue;
            }

            let gap = EngineError::GapDetected {
                interval: interval.clone(),
                tail_open_time: tail,
            };
            debug!(detected = %gap, "running gap repair");

            match self
                .client
                .fetch_klines(&self.symbol, interval, Some(start), None, 1_000)
                .await
            {
                Ok(bars) => {
                    let missed: Vec<Bar> =
                        bars.into_iter().filter(|b| b.closed && b.open_time >= start).collect();
                    if !missed.is_empty() {
                        info!(
                            interval = %interval,
                            count = missed.len(),
                            from = start,
                            "gap repair replaying missed bars"
                        );
                    }
                    for bar in missed {
                        self.ingest_commit(bar);
                    }
                }
                Err(e) => {
                    warn!(interval = %interval, error = %e, "gap repair fetch failed");
                    failed = true;
                }
            }
        }

        if failed {
            let failures = self.repair_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= MAX_REPAIR_FAILURES && !*self.degraded.read() {
                *self.degraded.write() = true;
                self.alerts.raise(
                    "source_degraded",
                    format!(
                        "gap repair failed {failures} times; serving stale state for {}",
                        self.symbol
                    ),
                );
            }
        } else {
            self.repair_failures.store(0, Ordering::SeqCst);
            *self.degraded.write() = false;
        }
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Buffer, persist, then broadcast — in that order, so consumers always
    /// observe a buffer that already contains the bar they were notified of.
    fn ingest_commit(&self, mut bar: Bar) {
        bar.closed = true;
        if let Err(e) = self.buffer.append_or_replace_last(bar.clone()) {
            warn!(error = %e, interval = %bar.interval, "commit rejected by buffer");
            return;
        }
        self.dao.upsert_bar(bar.clone());
        let _ = self.events.send(BarEvent::Commit(bar));
    }

    fn ingest_preview(&self, bar: Bar) {
        if let Err(e) = self.buffer.append_or_replace_last(bar.clone()) {
            warn!(error = %e, interval = %bar.interval, "preview rejected by buffer");
            return;
        }
        debug!(
            interval = %bar.interval,
            close = bar.close,
            "preview bar"
        );
        let _ = self.events.send(BarEvent::Preview(bar));
    }
}

/// Exponential backoff with jitter, capped at 30 s.
fn backoff_delay_ms(attempt: u32) -> u64 {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    (capped + jitter).min(BACKOFF_CAP_MS)
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// Parse a combined-stream kline frame into a [`Bar`].
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@kline_15m", "data": { "s": "BTCUSDT", "k": { ... } } }
/// ```
/// The direct single-stream payload (no `data` wrapper) is also accepted.
fn parse_combined_kline(text: &str, expect_symbol: &str) -> Result<Bar, EngineError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| EngineError::BadMessage(format!("invalid JSON: {e}")))?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| EngineError::BadMessage("missing field s".into()))?
        .to_uppercase();

    if symbol != expect_symbol {
        return Err(EngineError::BadMessage(format!(
            "unexpected symbol {symbol}"
        )));
    }

    let k = &data["k"];

    let bad = |f: &str| EngineError::BadMessage(format!("missing field k.{f}"));

    let interval = k["i"].as_str().ok_or_else(|| bad("i"))?.to_string();
    let open_time = k["t"].as_i64().ok_or_else(|| bad("t"))?;
    let close_time = k["T"].as_i64().ok_or_else(|| bad("T"))?;

    let num = |v: &serde_json::Value, f: &str| {
        parse_string_f64(v, f).map_err(|e| EngineError::BadMessage(e.to_string()))
    };

    Ok(Bar {
        symbol,
        interval,
        open_time,
        close_time,
        open: num(&k["o"], "k.o")?,
        high: num(&k["h"], "k.h")?,
        low: num(&k["l"], "k.l")?,
        close: num(&k["c"], "k.c")?,
        volume: num(&k["v"], "k.v")?,
        trade_count: k["n"].as_u64().ok_or_else(|| bad("n"))?,
        closed: k["x"].as_bool().ok_or_else(|| bad("x"))?,
        source: BarSource::Live,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = r#"{
        "stream": "btcusdt@kline_15m",
        "data": {
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "T": 1700000899999,
                "i": "15m",
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "123.456",
                "n": 1500,
                "x": false
            }
        }
    }"#;

    #[test]
    fn parse_combined_frame() {
        let bar = parse_combined_kline(FRAME, "BTCUSDT").unwrap();
        assert_eq!(bar.interval, "15m");
        assert_eq!(bar.open_time, 1700000000000);
        assert!((bar.close - 37020.0).abs() < f64::EPSILON);
        assert!(!bar.closed);
        assert_eq!(bar.source, BarSource::Live);
    }

    #[test]
    fn parse_rejects_wrong_symbol() {
        let err = parse_combined_kline(FRAME, "ETHUSDT");
        assert!(matches!(err, Err(EngineError::BadMessage(_))));
    }

    #[test]
    fn parse_rejects_truncated_frame() {
        let err = parse_combined_kline(r#"{"data":{"s":"BTCUSDT","k":{}}}"#, "BTCUSDT");
        assert!(matches!(err, Err(EngineError::BadMessage(_))));
    }

    #[test]
    fn backoff_grows_and_caps() {
        // Jitter makes the exact value non-deterministic; check the bounds.
        for attempt in 0..20 {
            let d = backoff_delay_ms(attempt);
            assert!(d <= BACKOFF_CAP_MS, "attempt {attempt} gave {d}");
        }
        assert!(backoff_delay_ms(0) >= BACKOFF_BASE_MS);
        // Deep attempts saturate exactly at the cap.
        assert_eq!(backoff_delay_ms(15), BACKOFF_CAP_MS);
    }

    #[test]
    fn conn_state_display() {
        assert_eq!(ConnState::Streaming.to_string(), "streaming");
        assert_eq!(ConnState::Reconnecting.to_string(), "reconnecting");
    }
}
