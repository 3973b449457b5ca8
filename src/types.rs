// =============================================================================
// Shared types used across the Vela paper-trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short; used in PnL arithmetic.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Taker side of an individual fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Whether a fill opens or reduces a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeKind {
    Entry,
    Exit,
}

impl std::fmt::Display for TradeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "ENTRY"),
            Self::Exit => write!(f, "EXIT"),
        }
    }
}

/// Why a position (or part of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Stop,
    Tp1,
    Tp2,
    TrendFail,
    Liq,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Tp1 => write!(f, "tp1"),
            Self::Tp2 => write!(f, "tp2"),
            Self::TrendFail => write!(f, "trend_fail"),
            Self::Liq => write!(f, "liq"),
        }
    }
}

impl CloseReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(Self::Stop),
            "tp1" => Some(Self::Tp1),
            "tp2" => Some(Self::Tp2),
            "trend_fail" => Some(Self::TrendFail),
            "liq" => Some(Self::Liq),
            _ => None,
        }
    }
}

/// Where a bar came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarSource {
    Warmup,
    Live,
}

impl std::fmt::Display for BarSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warmup => write!(f, "warmup"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Category of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerType {
    Fee,
    RealizedPnl,
    Funding,
}

impl std::fmt::Display for LedgerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fee => write!(f, "fee"),
            Self::RealizedPnl => write!(f, "realized_pnl"),
            Self::Funding => write!(f, "funding"),
        }
    }
}

/// A single simulated fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub position_id: String,
    pub strategy: String,
    pub side: TradeSide,
    pub kind: TradeKind,
    pub price: f64,
    pub qty: f64,
    pub notional: f64,
    pub fee_amount: f64,
    pub fee_rate: f64,
    pub ts_ms: i64,
    pub reason: String,
}

/// Append-only record of a balance-changing event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub strategy: String,
    pub ts_ms: i64,
    pub entry_type: LedgerType,
    /// Signed amount applied to the balance (fees are negative).
    pub amount: f64,
    /// Natural key of the event that caused this entry (trade id, funding ts).
    pub r#ref: String,
    pub note: String,
}

/// Point-in-time account valuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub strategy: String,
    pub ts_ms: i64,
    pub balance: f64,
    pub equity: f64,
    pub upl: f64,
    pub margin_used: f64,
    pub free_margin: f64,
}
