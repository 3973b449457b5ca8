// =============================================================================
// Indicator engine — incremental EMA/RSI/MACD/ATR with preview and commit
// =============================================================================
//
// One `IndicatorSet` exists per (strategy, interval).  The preview/commit
// distinction is structural:
//
//   * `commit(bar)` advances the internal state; the returned snapshot is
//     the frozen record for that open_time and the reference point for
//     slopes.
//   * `preview(bar)` clones the committed state, applies one step, and
//     returns the transient snapshot without mutating anything.  Slopes in
//     a preview are therefore measured against the last commit, which is
//     the "is momentum turning this bar?" reading the strategies want.
//
// Every closed-bar snapshot is reproducible by rerunning the batch twins
// (calculate_ema / calculate_rsi / calculate_macd / calculate_atr) over the
// same bar sequence; the replay tests below pin that contract.
// =============================================================================

pub mod atr;
pub mod ema;
pub mod macd;
pub mod rsi;

use serde::{Deserialize, Serialize};

use crate::market_data::Bar;
use crate::runtime_config::IndicatorConfig;

use atr::AtrState;
use ema::EmaState;
use macd::MacdState;
use rsi::RsiState;

// =============================================================================
// Snapshot
// =============================================================================

/// Committed or previewed indicator values for one (interval, open_time).
/// Fields stay `None` until the corresponding state is warm.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub open_time: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_fast: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_slow: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_signal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_hist: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_fast_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_slow_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_signal_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_hist_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_slope: Option<f64>,
}

/// Last committed value per field; the slope reference.
#[derive(Debug, Clone, Copy, Default)]
struct FieldValues {
    ema_fast: Option<f64>,
    ema_slow: Option<f64>,
    rsi: Option<f64>,
    macd: Option<f64>,
    macd_signal: Option<f64>,
    macd_hist: Option<f64>,
    atr: Option<f64>,
}

fn slope(now: Option<f64>, prev: Option<f64>) -> Option<f64> {
    match (now, prev) {
        (Some(n), Some(p)) => Some(n - p),
        _ => None,
    }
}

// =============================================================================
// Field hints — what the UI draws where
// =============================================================================

/// Where a snapshot field is rendered.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pane {
    Overlay,
    Sub,
}

/// How a snapshot field is drawn.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkKind {
    Line,
    Histogram,
}

/// Static render descriptor for one snapshot field.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FieldHint {
    pub pane: Pane,
    pub kind: MarkKind,
}

/// Descriptor table for every value field of [`IndicatorSnapshot`].
pub const FIELD_HINTS: &[(&str, FieldHint)] = &[
    ("ema_fast", FieldHint { pane: Pane::Overlay, kind: MarkKind::Line }),
    ("ema_slow", FieldHint { pane: Pane::Overlay, kind: MarkKind::Line }),
    ("rsi", FieldHint { pane: Pane::Sub, kind: MarkKind::Line }),
    ("macd", FieldHint { pane: Pane::Sub, kind: MarkKind::Line }),
    ("macd_signal", FieldHint { pane: Pane::Sub, kind: MarkKind::Line }),
    ("macd_hist", FieldHint { pane: Pane::Sub, kind: MarkKind::Histogram }),
    ("atr", FieldHint { pane: Pane::Sub, kind: MarkKind::Line }),
];

// =============================================================================
// IndicatorSet
// =============================================================================

/// All indicator states for one (strategy, interval).
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    ema_fast: EmaState,
    ema_slow: EmaState,
    rsi: RsiState,
    macd: MacdState,
    atr: AtrState,
    last: FieldValues,
}

impl IndicatorSet {
    pub fn new(cfg: &IndicatorConfig) -> Self {
        Self {
            ema_fast: EmaState::new(cfg.ema_fast),
            ema_slow: EmaState::new(cfg.ema_slow),
            rsi: RsiState::new(cfg.rsi_length),
            macd: MacdState::new(cfg.macd_fast, cfg.macd_slow, cfg.macd_signal),
            atr: AtrState::new(cfg.atr_length),
            last: FieldValues::default(),
        }
    }

    /// Advance every state with a closed bar and freeze the snapshot.
    pub fn commit(&mut self, bar: &Bar) -> IndicatorSnapshot {
        let prev = self.last;

        let ema_fast = self.ema_fast.update(bar.close);
        let ema_slow = self.ema_slow.update(bar.close);
        let rsi = self.rsi.update(bar.close);
        let macd = self.macd.update(bar.close);
        let atr = self.atr.update(bar.high, bar.low, bar.close);

        let values = FieldValues {
            ema_fast,
            ema_slow,
            rsi,
            macd: macd.map(|m| m.macd),
            macd_signal: macd.map(|m| m.signal),
            macd_hist: macd.map(|m| m.hist),
            atr,
        };
        self.last = values;

        snapshot_from(bar.open_time, values, prev)
    }

    /// Compute the snapshot *as if* the open bar closed at its latest price,
    /// without mutating committed state.
    pub fn preview(&self, bar: &Bar) -> IndicatorSnapshot {
        let mut transient = self.clone();
        transient.commit(bar)
    }

    /// Values at the last commit, as a slope-less snapshot.
    #[cfg(test)]
    pub fn committed(&self) -> IndicatorSnapshot {
        snapshot_from(0, self.last, self.last)
    }
}

fn snapshot_from(open_time: i64, values: FieldValues, prev: FieldValues) -> IndicatorSnapshot {
    IndicatorSnapshot {
        open_time,
        ema_fast: values.ema_fast,
        ema_slow: values.ema_slow,
        rsi: values.rsi,
        macd: values.macd,
        macd_signal: values.macd_signal,
        macd_hist: values.macd_hist,
        atr: values.atr,
        ema_fast_slope: slope(values.ema_fast, prev.ema_fast),
        ema_slow_slope: slope(values.ema_slow, prev.ema_slow),
        rsi_slope: slope(values.rsi, prev.rsi),
        macd_slope: slope(values.macd, prev.macd),
        macd_signal_slope: slope(values.macd_signal, prev.macd_signal),
        macd_hist_slope: slope(values.macd_hist, prev.macd_hist),
        atr_slope: slope(values.atr, prev.atr),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;

    fn cfg() -> IndicatorConfig {
        IndicatorConfig {
            ema_fast: 10,
            ema_slow: 20,
            rsi_length: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            atr_length: 14,
        }
    }

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            interval: "15m".into(),
            open_time,
            close_time: open_time + 899_999,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            trade_count: 50,
            closed: true,
            source: BarSource::Live,
        }
    }

    fn wavy_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                bar(
                    i as i64 * 900_000,
                    100.0 + (i as f64 * 0.3).sin() * 4.0 + i as f64 * 0.05,
                )
            })
            .collect()
    }

    #[test]
    fn replay_matches_batch_recomputation() {
        let bars = wavy_bars(120);
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let c = cfg();

        let mut set = IndicatorSet::new(&c);
        let mut last = IndicatorSnapshot::default();
        for b in &bars {
            last = set.commit(b);
        }

        let ema_fast = *ema::calculate_ema(&closes, c.ema_fast).last().unwrap();
        let ema_slow = *ema::calculate_ema(&closes, c.ema_slow).last().unwrap();
        let rsi = *rsi::calculate_rsi(&closes, c.rsi_length).last().unwrap();
        let macd = *macd::calculate_macd(&closes, c.macd_fast, c.macd_slow, c.macd_signal)
            .last()
            .unwrap();
        let atr = atr::calculate_atr(&bars, c.atr_length).unwrap();

        assert!((last.ema_fast.unwrap() - ema_fast).abs() < 1e-9);
        assert!((last.ema_slow.unwrap() - ema_slow).abs() < 1e-9);
        assert!((last.rsi.unwrap() - rsi).abs() < 1e-9);
        assert!((last.macd.unwrap() - macd.macd).abs() < 1e-9);
        assert!((last.macd_signal.unwrap() - macd.signal).abs() < 1e-9);
        assert!((last.macd_hist.unwrap() - macd.hist).abs() < 1e-9);
        assert!((last.atr.unwrap() - atr).abs() < 1e-9);
    }

    #[test]
    fn preview_is_pure() {
        let bars = wavy_bars(80);
        let c = cfg();

        let mut with_previews = IndicatorSet::new(&c);
        let mut without = IndicatorSet::new(&c);

        for (i, b) in bars.iter().enumerate() {
            // Interleave previews at a different price before each commit.
            let mut open_bar = b.clone();
            open_bar.close += 3.0;
            open_bar.closed = false;
            let _ = with_previews.preview(&open_bar);
            let _ = with_previews.preview(&open_bar);

            let a = with_previews.commit(b);
            let e = without.commit(b);

            if i > 60 {
                assert_eq!(a.ema_fast, e.ema_fast);
                assert_eq!(a.rsi, e.rsi);
                assert_eq!(a.macd_hist, e.macd_hist);
                assert_eq!(a.atr, e.atr);
            }
        }
    }

    #[test]
    fn preview_slope_is_against_last_commit() {
        let bars = wavy_bars(80);
        let c = cfg();

        let mut set = IndicatorSet::new(&c);
        for b in &bars {
            set.commit(b);
        }
        let committed = set.committed();

        let mut open_bar = bars.last().unwrap().clone();
        open_bar.open_time += 900_000;
        open_bar.close += 5.0;
        open_bar.closed = false;

        let preview = set.preview(&open_bar);
        let expected = preview.ema_fast.unwrap() - committed.ema_fast.unwrap();
        assert!((preview.ema_fast_slope.unwrap() - expected).abs() < 1e-12);
        // A higher close must pull the fast EMA up.
        assert!(preview.ema_fast_slope.unwrap() > 0.0);
    }

    #[test]
    fn uptrend_snapshot_shape() {
        // Monotone uptrend: fast above slow, RSI pegged high.
        let bars: Vec<Bar> = (0..300)
            .map(|i| bar(i as i64 * 900_000, 100.0 + i as f64 * 0.1))
            .collect();
        let mut set = IndicatorSet::new(&cfg());
        let mut last = IndicatorSnapshot::default();
        for b in &bars {
            last = set.commit(b);
        }
        assert!(last.ema_fast.unwrap() > last.ema_slow.unwrap());
        assert!(last.rsi.unwrap() > 60.0);
        assert!(last.macd_hist.is_some());
    }

    #[test]
    fn hints_cover_every_value_field() {
        let names: Vec<&str> = FIELD_HINTS.iter().map(|(n, _)| *n).collect();
        for f in ["ema_fast", "ema_slow", "rsi", "macd", "macd_signal", "macd_hist", "atr"] {
            assert!(names.contains(&f), "missing hint for {f}");
        }
    }
}
