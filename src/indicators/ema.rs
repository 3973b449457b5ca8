// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period`
// closes.  `EmaState` advances one close at a time; `calculate_ema` is the
// batch twin used to verify that incremental updates reproduce a fresh
// recomputation.
// =============================================================================

/// Incrementally updated EMA.
#[derive(Debug, Clone)]
pub struct EmaState {
    period: usize,
    multiplier: f64,
    /// Closes collected while seeding (len < period).
    seed: Vec<f64>,
    value: Option<f64>,
}

impl EmaState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            multiplier: 2.0 / (period.max(1) as f64 + 1.0),
            seed: Vec::with_capacity(period),
            value: None,
        }
    }

    /// Advance the state with one closed price.  Returns the EMA once the
    /// seed window is complete.
    pub fn update(&mut self, close: f64) -> Option<f64> {
        match self.value {
            Some(prev) => {
                let ema = close * self.multiplier + prev * (1.0 - self.multiplier);
                self.value = Some(ema);
                self.value
            }
            None => {
                self.seed.push(close);
                if self.seed.len() == self.period {
                    let sma = self.seed.iter().sum::<f64>() / self.period as f64;
                    self.value = Some(sma);
                }
                self.value
            }
        }
    }

}

/// Compute the full EMA series for `closes` — the batch twin of
/// [`EmaState`], used by the replay tests to verify that incremental
/// updates reproduce a fresh recomputation.
#[cfg(test)]
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        result.push(ema);
        prev = ema;
    }

    result
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_batch_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_batch_known_values() {
        // 5-period EMA of [1..10]: SMA seed 3.0, multiplier 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        assert!((ema[0] - expected).abs() < 1e-12);
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * mult + expected * (1.0 - mult);
            assert!((ema[i + 1] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn incremental_matches_batch() {
        let closes: Vec<f64> = (0..200)
            .map(|i| 100.0 + (i as f64 * 0.37).sin() * 8.0 + i as f64 * 0.05)
            .collect();
        let batch = calculate_ema(&closes, 20);

        let mut state = EmaState::new(20);
        let mut incremental = Vec::new();
        for &c in &closes {
            if let Some(v) = state.update(c) {
                incremental.push(v);
            }
        }

        assert_eq!(batch.len(), incremental.len());
        for (a, b) in batch.iter().zip(incremental.iter()) {
            assert!((a - b).abs() < 1e-9, "batch {a} vs incremental {b}");
        }
    }

    #[test]
    fn not_warm_before_period() {
        let mut state = EmaState::new(5);
        for i in 0..4 {
            assert!(state.update(i as f64).is_none());
        }
        assert!(state.update(4.0).is_some());
    }

    #[test]
    fn preview_by_clone_does_not_mutate() {
        let mut state = EmaState::new(3);
        state.update(1.0);
        state.update(2.0);
        let committed = state.update(3.0).unwrap();

        let mut copy = state.clone();
        let previewed = copy.update(10.0).unwrap();
        assert!(previewed > committed);

        // The original still continues from the committed value.
        let mut replay = state.clone();
        assert_eq!(replay.update(10.0).unwrap(), previewed);
    }
}
