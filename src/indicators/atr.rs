// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR using Wilder's method:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

#[cfg(test)]
use crate::market_data::Bar;

/// Incrementally updated ATR.
#[derive(Debug, Clone)]
pub struct AtrState {
    period: usize,
    prev_close: Option<f64>,
    seed_sum: f64,
    seed_count: usize,
    value: Option<f64>,
}

impl AtrState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            seed_sum: 0.0,
            seed_count: 0,
            value: None,
        }
    }

    /// Advance the state with one closed bar.  Returns the ATR once `period`
    /// true ranges have been consumed.
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let prev = match self.prev_close.replace(close) {
            Some(p) => p,
            None => return None,
        };

        let tr = true_range(high, low, prev);
        let period = self.period as f64;

        match self.value {
            Some(atr) => {
                self.value = Some((atr * (period - 1.0) + tr) / period);
            }
            None => {
                self.seed_sum += tr;
                self.seed_count += 1;
                if self.seed_count == self.period {
                    self.value = Some(self.seed_sum / period);
                }
            }
        }

        self.value
    }
}

fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    let hl = high - low;
    let hc = (high - prev_close).abs();
    let lc = (low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Compute the most recent ATR from a slice of bars — the batch twin of
/// [`AtrState`] used by the replay tests.  Returns `None` with fewer than
/// `period + 1` bars.
#[cfg(test)]
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        tr_values.push(true_range(bars[i].high, bars[i].low, bars[i - 1].close));
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }

    Some(atr)
}
