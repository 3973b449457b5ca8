// =============================================================================
// Engine error kinds
// =============================================================================
//
// Recovery policy per kind:
//   Transport         — backoff and reconnect locally, never fatal
//   GapDetected       — run gap repair; degraded after repeated failures
//   BadMessage        — log and drop, state machine does not advance
//   InvariantViolated — quarantine the affected strategy, others continue
//   Storage           — bounded retry, then memory-only mode
//   SubscriberTimeout — close that subscriber only
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("gap detected on {interval}: last open_time {tail_open_time}")]
    GapDetected { interval: String, tail_open_time: i64 },

    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("subscriber {0} timed out")]
    SubscriberTimeout(String),
}

impl EngineError {
    /// A stale bar delivered to the buffer (out-of-order open_time).
    pub fn stale_bar(interval: &str, open_time: i64, tail: i64) -> Self {
        Self::InvariantViolated(format!(
            "stale bar on {interval}: open_time {open_time} <= tail {tail}"
        ))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
