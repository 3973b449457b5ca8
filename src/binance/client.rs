// =============================================================================
// Binance REST API Client — public futures kline endpoints
// =============================================================================
//
// The engine only reads public market data; nothing is signed.  Every call
// carries a 10 s timeout and is retried up to 3 times with exponential
// backoff before the error is surfaced to the caller.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market_data::Bar;
use crate::types::BarSource;

/// Maximum klines per REST page.
pub const MAX_KLINES_PER_PAGE: usize = 1_000;

/// Retries per request before giving up.
const MAX_RETRIES: u32 = 3;

/// Base delay for the retry backoff (doubled per attempt).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Binance REST client for public kline data.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Self { base_url, client }
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines — a single page of bars, oldest-first.
    ///
    /// `closed` is derived from the bar's close_time: a kline whose window
    /// has not yet elapsed is the in-progress bar.
    #[instrument(skip(self), name = "binance::fetch_klines")]
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            interval,
            limit.min(MAX_KLINES_PER_PAGE)
        );
        if let Some(st) = start_time {
            url.push_str(&format!("&startTime={st}"));
        }
        if let Some(et) = end_time {
            url.push_str(&format!("&endTime={et}"));
        }

        let body = self.get_with_retry(&url).await?;

        let rows = body
            .as_array()
            .context("klines response is not a JSON array")?;

        let now = Self::now_ms();
        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            bars.push(parse_kline_row(row, symbol, interval, now)?);
        }

        debug!(count = bars.len(), symbol, interval, "klines page fetched");
        Ok(bars)
    }

    /// Page backwards until `want` closed bars are collected or the exchange
    /// runs out of history.  Returns bars oldest-first.
    #[instrument(skip(self), name = "binance::fetch_klines_back")]
    pub async fn fetch_klines_back(
        &self,
        symbol: &str,
        interval: &str,
        want: usize,
    ) -> Result<Vec<Bar>> {
        let mut collected: Vec<Bar> = Vec::with_capacity(want);
        let mut end_time: Option<i64> = None;

        loop {
            let page = self
                .fetch_klines(symbol, interval, None, end_time, MAX_KLINES_PER_PAGE)
                .await?;

            let raw_len = page.len();
            let closed: Vec<Bar> = page.into_iter().filter(|b| b.closed).collect();
            if closed.is_empty() {
                break;
            }

            end_time = Some(closed[0].open_time - 1);

            // Prepend the older page.
            let mut merged = closed;
            merged.extend(collected);
            collected = merged;

            if collected.len() >= want || raw_len < MAX_KLINES_PER_PAGE {
                break;
            }
        }

        // Keep only the newest `want` bars.
        let start = collected.len().saturating_sub(want);
        Ok(collected.split_off(start))
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn get_with_retry(&self, url: &str) -> Result<serde_json::Value> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            match self.try_get(url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(attempt, error = %e, "REST request failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request failed with no attempts")))
    }

    async fn try_get(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("REST request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse REST response as JSON")?;

        if !status.is_success() {
            anyhow::bail!("REST request returned {status}: {body}");
        }
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one row of the klines array response.
///
/// Row shape: `[open_time, "o", "h", "l", "c", "v", close_time, "qv", n, ...]`
/// — numeric prices arrive as JSON strings.
fn parse_kline_row(
    row: &serde_json::Value,
    symbol: &str,
    interval: &str,
    now_ms: i64,
) -> Result<Bar> {
    let cols = row.as_array().context("kline row is not an array")?;
    if cols.len() < 9 {
        anyhow::bail!("kline row has {} columns, expected >= 9", cols.len());
    }

    let open_time = cols[0].as_i64().context("kline open_time missing")?;
    let close_time = cols[6].as_i64().context("kline close_time missing")?;

    Ok(Bar {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        open_time,
        close_time,
        open: parse_string_f64(&cols[1], "open")?,
        high: parse_string_f64(&cols[2], "high")?,
        low: parse_string_f64(&cols[3], "low")?,
        close: parse_string_f64(&cols[4], "close")?,
        volume: parse_string_f64(&cols[5], "volume")?,
        trade_count: cols[8].as_u64().context("kline trade count missing")?,
        closed: close_time <= now_ms,
        source: BarSource::Warmup,
    })
}

/// Binance sends numeric values as JSON strings inside kline payloads.
pub(crate) fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
