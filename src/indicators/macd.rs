// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   macd   = EMA(fast) - EMA(slow)
//   signal = EMA(signal_period) over the macd series
//   hist   = macd - signal
//
// All three EMAs use the shared SMA seeding (see ema.rs).  The signal line
// starts seeding only once both source EMAs are warm, so the first output
// appears after `slow + signal_period` closes.
// =============================================================================

#[cfg(test)]
use crate::indicators::ema::calculate_ema;
use crate::indicators::ema::EmaState;

/// One warm MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub hist: f64,
}

/// Incrementally updated MACD.
#[derive(Debug, Clone)]
pub struct MacdState {
    fast: EmaState,
    slow: EmaState,
    signal: EmaState,
}

impl MacdState {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: EmaState::new(fast),
            slow: EmaState::new(slow),
            signal: EmaState::new(signal),
        }
    }

    /// Advance all three EMAs with one closed price.
    pub fn update(&mut self, close: f64) -> Option<MacdValue> {
        let fast = self.fast.update(close);
        let slow = self.slow.update(close);

        let (Some(f), Some(s)) = (fast, slow) else {
            return None;
        };

        let macd = f - s;
        let signal = self.signal.update(macd)?;
        Some(MacdValue { macd, signal, hist: macd - signal })
    }
}

/// Compute the full MACD series — the batch twin of [`MacdState`] used by
/// the replay tests.  Output starts once the signal EMA is warm; one
/// element per close from index `slow + signal - 1`.
#[cfg(test)]
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Vec<MacdValue> {
    if fast == 0 || slow == 0 || signal == 0 || closes.len() < slow {
        return Vec::new();
    }

    let fast_series = calculate_ema(closes, fast);
    let slow_series = calculate_ema(closes, slow);

    // Align both series on the close index: fast starts at fast-1, slow at
    // slow-1.  The macd series exists from index slow-1 on.
    let offset = slow - fast;
    let macd_series: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, s)| fast_series[i + offset] - s)
        .collect();

    let signal_series = calculate_ema(&macd_series, signal);
    let macd_offset = signal - 1;

    signal_series
        .iter()
        .enumerate()
        .map(|(i, &sig)| {
            let macd = macd_series[i + macd_offset];
            MacdValue { macd, signal: sig, hist: macd - sig }
        })
        .collect()
}
