// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Price deltas from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first
//          `period` gains / losses.
// Step 3 — Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + loss) / period
// Step 4 — RS = avg_gain / avg_loss, RSI = 100 - 100 / (1 + RS)
//
// Clamps: RSI = 100 when the loss average is zero, 0 when the gain average
// is zero, 50 when there has been no movement at all.
// =============================================================================

/// Incrementally updated RSI.
#[derive(Debug, Clone)]
pub struct RsiState {
    period: usize,
    prev_close: Option<f64>,
    seed_gain: f64,
    seed_loss: f64,
    seed_count: usize,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
}

impl RsiState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            seed_gain: 0.0,
            seed_loss: 0.0,
            seed_count: 0,
            avg_gain: None,
            avg_loss: None,
        }
    }

    /// Advance the state with one closed price.  Returns the RSI once
    /// `period` deltas have been consumed.
    pub fn update(&mut self, close: f64) -> Option<f64> {
        let prev = match self.prev_close.replace(close) {
            Some(p) => p,
            None => return None,
        };

        let delta = close - prev;
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        let period = self.period as f64;

        match (self.avg_gain, self.avg_loss) {
            (Some(ag), Some(al)) => {
                self.avg_gain = Some((ag * (period - 1.0) + gain) / period);
                self.avg_loss = Some((al * (period - 1.0) + loss) / period);
            }
            _ => {
                self.seed_gain += gain;
                self.seed_loss += loss;
                self.seed_count += 1;
                if self.seed_count == self.period {
                    self.avg_gain = Some(self.seed_gain / period);
                    self.avg_loss = Some(self.seed_loss / period);
                }
            }
        }

        self.value()
    }

    /// Last committed value, if warm.
    pub fn value(&self) -> Option<f64> {
        match (self.avg_gain, self.avg_loss) {
            (Some(ag), Some(al)) => Some(rsi_from_averages(ag, al)),
            _ => None,
        }
    }
}

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Compute the full RSI series for `closes` — the batch twin of
/// [`RsiState`] used by the replay tests.
#[cfg(test)]
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    result.push(rsi_from_averages(avg_gain, avg_loss));

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        result.push(rsi_from_averages(avg_gain, avg_loss));
    }

    result
}
