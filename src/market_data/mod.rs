// =============================================================================
// Market data: bars, bar events, and the per-interval kline buffer
// =============================================================================

pub mod kline_buffer;
pub mod source;

pub use kline_buffer::KlineBuffer;

use serde::{Deserialize, Serialize};

use crate::types::BarSource;

/// A single OHLCV bar normalised from the exchange kline feed.
///
/// `(symbol, interval, open_time)` is the natural key everywhere: in the
/// buffer, in the database, and in indicator snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub closed: bool,
    pub source: BarSource,
}

/// The preview/commit distinction is first-class: previews are pure and
/// restartable, commits advance persisted state.
#[derive(Debug, Clone)]
pub enum BarEvent {
    /// In-progress update of the open bar.  Never persisted.
    Preview(Bar),
    /// Final record for its open_time.  Exactly one per bar (gap repair
    /// re-delivers idempotently).
    Commit(Bar),
}

impl BarEvent {
    pub fn bar(&self) -> &Bar {
        match self {
            Self::Preview(b) | Self::Commit(b) => b,
        }
    }
}

/// Milliseconds in one bar of the given interval.  Supports the Binance
/// kline interval notation.
pub fn interval_ms(interval: &str) -> Option<i64> {
    let (num, unit) = interval.split_at(interval.len().checked_sub(1)?);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }
    let unit_ms = match unit {
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        _ => return None,
    };
    Some(n * unit_ms)
}
