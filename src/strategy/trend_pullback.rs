// =============================================================================
// Trend + Pullback — the reference strategy
// =============================================================================
//
// Higher-timeframe filter (1h commits): cache direction permissions from the
// EMA stack, RSI side and normalised EMA separation.
//
// Execution timeframe (15m commits): enter on a pullback to the fast EMA
// while the trend holds and momentum (MACD histogram) is turning back in the
// trade direction.  Stops are the wider of the structural swing and an ATR
// multiple; targets sit at 1R and 2R.
//
// Exits between commits (stop / TP1 / TP2 / liquidation) belong to the
// matcher; this module only decides the trend-failure exit and entries.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::indicators::IndicatorSnapshot;
use crate::market_data::Bar;
use crate::runtime_config::StrategyParams;
use crate::sim::matcher::EntryIntent;
use crate::sim::AccountView;
use crate::types::Side;

// =============================================================================
// Condition checklist
// =============================================================================

/// One boolean clause of the entry logic, named for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct ChecklistItem {
    pub name: String,
    pub ok: bool,
}

/// Which entry clauses currently hold, published on every preview.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionChecklist {
    pub strategy: String,
    pub ts_ms: i64,
    pub long_permitted: bool,
    pub short_permitted: bool,
    pub in_cooldown: bool,
    pub position_open: bool,
    pub long: Vec<ChecklistItem>,
    pub short: Vec<ChecklistItem>,
}

fn item(name: &str, ok: bool) -> ChecklistItem {
    ChecklistItem { name: name.to_string(), ok }
}

// =============================================================================
// Sizing limits shared by all instances
// =============================================================================

/// Account-level sizing limits injected from the runtime config.
#[derive(Debug, Clone, Copy)]
pub struct SizingLimits {
    pub max_position_notional: f64,
    pub max_position_pct_equity: f64,
    pub leverage: f64,
}

// =============================================================================
// Strategy
// =============================================================================

/// Per-instance decision logic.  Owns nothing but its parameters and the
/// cached higher-timeframe permissions.
#[derive(Debug, Clone)]
pub struct TrendPullback {
    params: StrategyParams,
    limits: SizingLimits,
    long_permitted: bool,
    short_permitted: bool,
}

impl TrendPullback {
    pub fn new(params: StrategyParams, limits: SizingLimits) -> Self {
        Self {
            params,
            limits,
            long_permitted: false,
            short_permitted: false,
        }
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    // -------------------------------------------------------------------------
    // Higher-timeframe filter
    // -------------------------------------------------------------------------

    /// Refresh direction permissions from a committed higher-timeframe bar.
    pub fn on_htf_commit(&mut self, bar: &Bar, snap: &IndicatorSnapshot) {
        let (Some(ema_fast), Some(ema_slow), Some(rsi)) =
            (snap.ema_fast, snap.ema_slow, snap.rsi)
        else {
            self.long_permitted = false;
            self.short_permitted = false;
            return;
        };

        let strength = if bar.close.abs() > f64::EPSILON {
            (ema_fast - ema_slow).abs() / bar.close
        } else {
            0.0
        };
        let strong = strength >= self.params.trend_strength_min;

        self.long_permitted =
            bar.close > ema_slow && ema_fast > ema_slow && rsi > 50.0 && strong;
        self.short_permitted =
            bar.close < ema_slow && ema_fast < ema_slow && rsi < 50.0 && strong;

        debug!(
            interval = %bar.interval,
            long = self.long_permitted,
            short = self.short_permitted,
            strength,
            "higher-timeframe permissions refreshed"
        );
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Evaluate the pullback entry on a committed execution bar.
    ///
    /// `hist_window` holds the last committed MACD histogram values,
    /// newest last, including the current bar's.
    pub fn entry_side(
        &self,
        bar: &Bar,
        snap: &IndicatorSnapshot,
        hist_window: &[f64],
    ) -> Option<Side> {
        if self.long_conditions(bar, snap, hist_window).iter().all(|c| c.ok) {
            return Some(Side::Long);
        }
        if self.short_conditions(bar, snap, hist_window).iter().all(|c| c.ok) {
            return Some(Side::Short);
        }
        None
    }

    fn long_conditions(
        &self,
        bar: &Bar,
        snap: &IndicatorSnapshot,
        hist_window: &[f64],
    ) -> Vec<ChecklistItem> {
        let p = &self.params;
        let ema_fast = snap.ema_fast.unwrap_or(f64::NAN);
        let ema_slow = snap.ema_slow.unwrap_or(f64::NAN);
        let rsi = snap.rsi.unwrap_or(f64::NAN);

        vec![
            item("htf_long_permitted", self.long_permitted),
            item("pullback_to_ema_fast", bar.low <= ema_fast),
            item("close_above_ema_slow", bar.close > ema_slow),
            item(
                "rsi_in_long_band",
                rsi >= p.rsi_long_lo && rsi <= p.rsi_long_hi,
            ),
            item(
                "rsi_slope_up",
                !p.rsi_slope_required || snap.rsi_slope.is_some_and(|s| s > 0.0),
            ),
            item("macd_hist_rising", hist_strictly(hist_window, true)),
        ]
    }

    fn short_conditions(
        &self,
        bar: &Bar,
        snap: &IndicatorSnapshot,
        hist_window: &[f64],
    ) -> Vec<ChecklistItem> {
        let p = &self.params;
        let ema_fast = snap.ema_fast.unwrap_or(f64::NAN);
        let ema_slow = snap.ema_slow.unwrap_or(f64::NAN);
        let rsi = snap.rsi.unwrap_or(f64::NAN);

        vec![
            item("htf_short_permitted", self.short_permitted),
            item("pullback_to_ema_fast", bar.high >= ema_fast),
            item("close_below_ema_slow", bar.close < ema_slow),
            item(
                "rsi_in_short_band",
                rsi >= p.rsi_short_lo && rsi <= p.rsi_short_hi,
            ),
            item(
                "rsi_slope_down",
                !p.rsi_slope_required || snap.rsi_slope.is_some_and(|s| s < 0.0),
            ),
            item("macd_hist_falling", hist_strictly(hist_window, false)),
        ]
    }

    /// Size the entry and place the protective levels.
    ///
    /// Returns `None` when the stop cannot be placed on the protective side
    /// of the entry (degenerate ATR or swing data).
    pub fn build_entry(
        &self,
        side: Side,
        bar: &Bar,
        snap: &IndicatorSnapshot,
        view: &AccountView,
        swing_bars: &[Bar],
    ) -> Option<EntryIntent> {
        let entry = bar.close;
        let atr = snap.atr?;
        if entry <= 0.0 || atr <= 0.0 {
            return None;
        }

        let l = &self.limits;
        let notional =
            l.max_position_notional.min(l.max_position_pct_equity * view.equity) * l.leverage;
        if notional <= 0.0 {
            return None;
        }
        let margin = notional / l.leverage;
        let qty = notional / entry;

        let atr_stop = match side {
            Side::Long => entry - self.params.atr_stop_mult * atr,
            Side::Short => entry + self.params.atr_stop_mult * atr,
        };

        // Structural stop: most recent swing extreme over the lookback.
        let structural = match side {
            Side::Long => swing_bars.iter().map(|b| b.low).fold(f64::INFINITY, f64::min),
            Side::Short => swing_bars.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max),
        };

        // The wider stop (further from entry) wins.
        let stop_price = match side {
            Side::Long if structural.is_finite() => atr_stop.min(structural),
            Side::Short if structural.is_finite() => atr_stop.max(structural),
            _ => atr_stop,
        };

        let r = (entry - stop_price).abs();
        if r <= 0.0 {
            return None;
        }
        match side {
            Side::Long if stop_price >= entry => return None,
            Side::Short if stop_price <= entry => return None,
            _ => {}
        }

        let (tp1_price, tp2_price) = match side {
            Side::Long => (entry + r, entry + 2.0 * r),
            Side::Short => (entry - r, entry - 2.0 * r),
        };

        Some(EntryIntent {
            side,
            price: entry,
            qty,
            notional,
            margin,
            leverage: l.leverage,
            stop_price,
            tp1_price,
            tp2_price,
            ts_ms: bar.close_time,
        })
    }

    // -------------------------------------------------------------------------
    // Trend-failure exit
    // -------------------------------------------------------------------------

    /// Commit-only exit: the pullback became a breakdown.
    pub fn trend_failed(&self, side: Side, bar: &Bar, snap: &IndicatorSnapshot) -> bool {
        let (Some(ema_fast), Some(rsi)) = (snap.ema_fast, snap.rsi) else {
            return false;
        };
        match side {
            Side::Long => bar.close < ema_fast && rsi < 50.0,
            Side::Short => bar.close > ema_fast && rsi > 50.0,
        }
    }

    // -------------------------------------------------------------------------
    // Checklist
    // -------------------------------------------------------------------------

    /// Build the full checklist against the current preview state.
    pub fn checklist(
        &self,
        strategy: &str,
        bar: &Bar,
        snap: &IndicatorSnapshot,
        hist_window: &[f64],
        in_cooldown: bool,
        position_open: bool,
    ) -> ConditionChecklist {
        ConditionChecklist {
            strategy: strategy.to_string(),
            ts_ms: bar.close_time,
            long_permitted: self.long_permitted,
            short_permitted: self.short_permitted,
            in_cooldown,
            position_open,
            long: self.long_conditions(bar, snap, hist_window),
            short: self.short_conditions(bar, snap, hist_window),
        }
    }
}

/// True when the window's newest values are strictly monotone in the given
/// direction over the last two steps (needs three committed values).
fn hist_strictly(window: &[f64], rising: bool) -> bool {
    if window.len() < 3 {
        return false;
    }
    let h0 = window[window.len() - 1];
    let h1 = window[window.len() - 2];
    let h2 = window[window.len() - 3];
    if rising {
        h0 > h1 && h1 > h2
    } else {
        h0 < h1 && h1 < h2
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;

    fn limits() -> SizingLimits {
        SizingLimits {
            max_position_notional: 50_000.0,
            max_position_pct_equity: 0.25,
            leverage: 5.0,
        }
    }

    fn strategy() -> TrendPullback {
        TrendPullback::new(StrategyParams::default(), limits())
    }

    fn bar(interval: &str, close: f64, high: f64, low: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            interval: interval.into(),
            open_time: 0,
            close_time: 899_999,
            open: close,
            high,
            low,
            close,
            volume: 10.0,
            trade_count: 5,
            closed: true,
            source: BarSource::Live,
        }
    }

    fn snap(ema_fast: f64, ema_slow: f64, rsi: f64, rsi_slope: f64, atr: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            open_time: 0,
            ema_fast: Some(ema_fast),
            ema_slow: Some(ema_slow),
            rsi: Some(rsi),
            macd: Some(0.0),
            macd_signal: Some(0.0),
            macd_hist: Some(0.5),
            atr: Some(atr),
            rsi_slope: Some(rsi_slope),
            ..Default::default()
        }
    }

    fn view(equity: f64) -> AccountView {
        AccountView {
            strategy: "s1".into(),
            balance: equity,
            equity,
            upl: 0.0,
            margin_used: 0.0,
            free_margin: equity,
            position: None,
            liq_price: None,
        }
    }

    #[test]
    fn htf_permissions_from_trend() {
        let mut s = strategy();
        // Bullish 1h: close and fast EMA above slow, RSI > 50, wide spread.
        s.on_htf_commit(&bar("1h", 105.0, 106.0, 104.0), &snap(104.0, 100.0, 60.0, 0.1, 1.0));
        assert!(s.long_permitted && !s.short_permitted);

        // Bearish mirror.
        s.on_htf_commit(&bar("1h", 95.0, 96.0, 94.0), &snap(96.0, 100.0, 40.0, -0.1, 1.0));
        assert!(!s.long_permitted && s.short_permitted);

        // Weak separation fails the strength gate.
        s.on_htf_commit(
            &bar("1h", 105.0, 106.0, 104.0),
            &snap(100.01, 100.0, 60.0, 0.1, 1.0),
        );
        assert!(!s.long_permitted && !s.short_permitted);
    }

    #[test]
    fn long_entry_requires_all_clauses() {
        let mut s = strategy();
        s.on_htf_commit(&bar("1h", 105.0, 106.0, 104.0), &snap(104.0, 100.0, 60.0, 0.1, 1.0));

        // Pullback bar: low tags the fast EMA, close holds above the slow.
        let b = bar("15m", 103.0, 103.5, 101.5);
        let sn = snap(102.0, 100.0, 55.0, 0.5, 1.0);
        let rising = [0.1, 0.2, 0.3];

        assert_eq!(s.entry_side(&b, &sn, &rising), Some(Side::Long));

        // Histogram not rising -> no entry.
        assert_eq!(s.entry_side(&b, &sn, &[0.3, 0.2, 0.1]), None);

        // RSI outside the band -> no entry.
        let hot = snap(102.0, 100.0, 80.0, 0.5, 1.0);
        assert_eq!(s.entry_side(&b, &hot, &rising), None);

        // No pullback (low stays above the fast EMA) -> no entry.
        let no_pull = bar("15m", 103.0, 103.5, 102.5);
        assert_eq!(s.entry_side(&no_pull, &sn, &rising), None);
    }

    #[test]
    fn short_entry_mirrors() {
        let mut s = strategy();
        s.on_htf_commit(&bar("1h", 95.0, 96.0, 94.0), &snap(96.0, 100.0, 40.0, -0.1, 1.0));

        let b = bar("15m", 97.0, 98.5, 96.5);
        let sn = snap(98.0, 100.0, 45.0, -0.5, 1.0);
        let falling = [0.3, 0.2, 0.1];

        assert_eq!(s.entry_side(&b, &sn, &falling), Some(Side::Short));

        // RSI below the short band floor is blocked.
        let washed = snap(98.0, 100.0, 20.0, -0.5, 1.0);
        assert_eq!(s.entry_side(&b, &washed, &falling), None);
    }

    #[test]
    fn entry_sizing_and_targets() {
        let s = strategy();
        let b = bar("15m", 100.0, 100.5, 98.0);
        let sn = snap(99.0, 95.0, 55.0, 0.5, 2.0);

        // Swing low at 97 is inside the ATR stop (100 - 1.5*2 = 97), equal
        // distance; push one bar lower to make the structural stop win.
        let swing = vec![
            bar("15m", 99.0, 100.0, 96.0),
            bar("15m", 100.0, 101.0, 98.0),
        ];

        let intent = s.build_entry(Side::Long, &b, &sn, &view(10_000.0), &swing).unwrap();

        // notional = min(50_000, 0.25 * 10_000) * 5 = 12_500.
        assert!((intent.notional - 12_500.0).abs() < 1e-9);
        assert!((intent.margin - 2_500.0).abs() < 1e-9);
        assert!((intent.qty - 125.0).abs() < 1e-9);

        // Structural stop 96 beats ATR stop 97 (wider).
        assert!((intent.stop_price - 96.0).abs() < 1e-9);
        let r = 100.0 - 96.0;
        assert!((intent.tp1_price - (100.0 + r)).abs() < 1e-9);
        assert!((intent.tp2_price - (100.0 + 2.0 * r)).abs() < 1e-9);
    }

    #[test]
    fn atr_stop_wins_when_wider() {
        let s = strategy();
        let b = bar("15m", 100.0, 100.5, 99.0);
        let sn = snap(99.0, 95.0, 55.0, 0.5, 4.0); // ATR stop at 94
        let swing = vec![bar("15m", 99.0, 100.0, 98.0)]; // swing low 98

        let intent = s.build_entry(Side::Long, &b, &sn, &view(10_000.0), &swing).unwrap();
        assert!((intent.stop_price - 94.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_stop_rejected() {
        let s = strategy();
        let b = bar("15m", 100.0, 100.5, 99.0);
        let no_atr = IndicatorSnapshot::default();
        assert!(s.build_entry(Side::Long, &b, &no_atr, &view(10_000.0), &[]).is_none());
    }

    #[test]
    fn trend_fail_detection() {
        let s = strategy();
        let sn = snap(102.0, 100.0, 45.0, -0.5, 1.0);

        // Close below fast EMA with RSI < 50 fails a long.
        assert!(s.trend_failed(Side::Long, &bar("15m", 101.0, 102.0, 100.5), &sn));
        // RSI holding above 50 keeps the long alive.
        let strong = snap(102.0, 100.0, 55.0, 0.5, 1.0);
        assert!(!s.trend_failed(Side::Long, &bar("15m", 101.0, 102.0, 100.5), &strong));
        // Mirror for shorts.
        assert!(s.trend_failed(Side::Short, &bar("15m", 103.0, 103.5, 102.0), &strong));
    }

    #[test]
    fn checklist_names_every_clause() {
        let s = strategy();
        let b = bar("15m", 103.0, 103.5, 101.5);
        let sn = snap(102.0, 100.0, 55.0, 0.5, 1.0);
        let cl = s.checklist("s1", &b, &sn, &[0.1, 0.2, 0.3], false, false);

        assert_eq!(cl.long.len(), 6);
        assert_eq!(cl.short.len(), 6);
        assert!(cl.long.iter().any(|c| c.name == "macd_hist_rising" && c.ok));
        assert!(!cl.position_open);
    }

    #[test]
    fn hist_window_needs_three_values() {
        assert!(!hist_strictly(&[0.1, 0.2], true));
        assert!(hist_strictly(&[0.0, 0.1, 0.2], true));
        assert!(!hist_strictly(&[0.0, 0.2, 0.2], true));
        assert!(hist_strictly(&[0.2, 0.1, 0.0], false));
    }
}
