// =============================================================================
// Account & Position — per-strategy simulated balance and open position
// =============================================================================
//
// Each strategy instance owns exactly one Account; at most one position is
// open at a time.  Margin is reserved on the position, never moved through
// the balance: the balance changes only via ledger events (fees, realized
// PnL, funding), which keeps `initial_capital + sum(ledger) == balance`
// exact at all times.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{CloseReason, Side};

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub strategy: String,
    pub side: Side,
    /// Remaining open quantity (reduced on partial close).
    pub qty: f64,
    /// Quantity at entry; partial-close fractions are measured against this.
    pub full_qty: f64,
    pub entry_price: f64,
    pub entry_time_ms: i64,
    pub leverage: f64,
    /// Remaining reserved margin, released pro rata on partial close.
    pub margin: f64,
    pub stop_price: f64,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub status: PositionStatus,
    pub realized_pnl: f64,
    pub fees_total: f64,
    pub liq_price: f64,
    #[serde(default)]
    pub close_time_ms: Option<i64>,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
}

impl Position {
    /// Unrealized PnL at `mark`.
    pub fn upl(&self, mark: f64) -> f64 {
        (mark - self.entry_price) * self.qty * self.side.direction()
    }
}

/// In-memory account for one strategy instance.
#[derive(Debug, Clone)]
pub struct Account {
    pub strategy: String,
    pub initial_capital: f64,
    pub balance: f64,
    pub open_position: Option<Position>,
    /// No new entries before this timestamp (set after a stop-out).
    pub cooldown_until_ms: Option<i64>,
}

impl Account {
    pub fn new(strategy: impl Into<String>, initial_capital: f64) -> Self {
        Self {
            strategy: strategy.into(),
            initial_capital,
            balance: initial_capital,
            open_position: None,
            cooldown_until_ms: None,
        }
    }

    pub fn upl(&self, mark: f64) -> f64 {
        self.open_position.as_ref().map_or(0.0, |p| p.upl(mark))
    }

    /// equity = balance + unrealized PnL of the open position.
    pub fn equity(&self, mark: f64) -> f64 {
        self.balance + self.upl(mark)
    }

    pub fn margin_used(&self) -> f64 {
        self.open_position.as_ref().map_or(0.0, |p| p.margin)
    }

    pub fn free_margin(&self, mark: f64) -> f64 {
        self.equity(mark) - self.margin_used()
    }

    pub fn in_cooldown(&self, ts_ms: i64) -> bool {
        self.cooldown_until_ms.is_some_and(|until| ts_ms < until)
    }

    /// Immutable snapshot for sizing decisions and the status API.
    pub fn view(&self, mark: f64) -> AccountView {
        AccountView {
            strategy: self.strategy.clone(),
            balance: self.balance,
            equity: self.equity(mark),
            upl: self.upl(mark),
            margin_used: self.margin_used(),
            free_margin: self.free_margin(mark),
            position: self.open_position.as_ref().map(|p| PositionView {
                side: p.side,
                qty: p.qty,
                entry_price: p.entry_price,
                stop_price: p.stop_price,
                tp1_price: p.tp1_price,
                tp2_price: p.tp2_price,
            }),
            liq_price: self.open_position.as_ref().map(|p| p.liq_price),
        }
    }
}

/// Read-only account snapshot published to the API and fan-out bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountView {
    pub strategy: String,
    pub balance: f64,
    pub equity: f64,
    pub upl: f64,
    pub margin_used: f64,
    pub free_margin: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liq_price: Option<f64>,
}

/// Open-position subset exposed on the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub tp1_price: f64,
    pub tp2_price: f64,
}
