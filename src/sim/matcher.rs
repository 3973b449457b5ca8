// =============================================================================
// Simulated Matcher — fills order intents and manages protective exits
// =============================================================================
//
// Every state mutation produces rows for the DAO (trades, ledger, equity
// snapshots, position upserts) and events for the fan-out bus, collected in
// a MatchOutcome.  The caller (the strategy task) forwards them; the matcher
// itself never touches storage or the network.
//
// Exit resolution within one preview bar is deliberately coarse: when both
// the stop and a take-profit sit inside [low, high], the bar's direction
// decides which price path is assumed (close > open -> take-profit side
// first, otherwise stop first).  Tick-level sequencing is not reconstructed.
// =============================================================================

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::market_data::Bar;
use crate::runtime_config::MmrTier;
use crate::sim::account::{Account, Position, PositionStatus};
use crate::sim::liquidation;
use crate::types::{CloseReason, EquitySnapshot, LedgerEntry, LedgerType, Side, Trade, TradeKind, TradeSide};

/// Fraction of the full quantity closed when TP1 is hit.
const TP1_CLOSE_FRACTION: f64 = 0.5;

/// Quantities below this are treated as fully closed.
const QTY_EPSILON: f64 = 1e-12;

// =============================================================================
// Intents & outcomes
// =============================================================================

/// A fully sized entry produced by a strategy on a commit bar.
#[derive(Debug, Clone)]
pub struct EntryIntent {
    pub side: Side,
    /// Decision price: the commit bar's close.
    pub price: f64,
    pub qty: f64,
    pub notional: f64,
    pub margin: f64,
    pub leverage: f64,
    pub stop_price: f64,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub ts_ms: i64,
}

/// Lifecycle event emitted towards the fan-out bus.
#[derive(Debug, Clone)]
pub enum MatchEvent {
    Entry { position: Position, trade: Trade },
    Tp1 { position: Position, trade: Trade },
    Tp2 { position: Position, trade: Trade },
    Exit { position: Position, trade: Trade, reason: CloseReason },
    Liq { position: Position, trade: Trade },
    Funding { amount: f64 },
}

impl MatchEvent {
    /// Short tag used on the stream channel.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Entry { .. } => "entry",
            Self::Tp1 { .. } => "tp1",
            Self::Tp2 { .. } => "tp2",
            Self::Exit { .. } => "exit",
            Self::Liq { .. } => "liq",
            Self::Funding { .. } => "funding",
        }
    }
}

/// Everything a matcher operation produced, in emission order.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub trades: Vec<Trade>,
    pub ledger: Vec<LedgerEntry>,
    pub snapshots: Vec<EquitySnapshot>,
    /// Position rows to upsert, in mutation order.
    pub positions: Vec<Position>,
    pub events: Vec<MatchEvent>,
    /// True when a stop-out fully closed the position (starts the cooldown).
    pub stop_out: bool,
}

impl MatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty() && self.ledger.is_empty() && self.events.is_empty()
    }

    fn merge(&mut self, mut other: MatchOutcome) {
        self.trades.append(&mut other.trades);
        self.ledger.append(&mut other.ledger);
        self.snapshots.append(&mut other.snapshots);
        self.positions.append(&mut other.positions);
        self.events.append(&mut other.events);
        self.stop_out |= other.stop_out;
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// Stateless fill engine; all mutable state lives in the Account it is
/// handed.
#[derive(Debug, Clone)]
pub struct Matcher {
    fee_rate: f64,
    tiers: Vec<MmrTier>,
}

impl Matcher {
    pub fn new(fee_rate: f64, tiers: Vec<MmrTier>) -> Self {
        Self { fee_rate, tiers }
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Fill an entry intent at its decision price.
    pub fn open(
        &self,
        account: &mut Account,
        intent: &EntryIntent,
    ) -> Result<MatchOutcome, EngineError> {
        if account.open_position.is_some() {
            return Err(EngineError::InvariantViolated(format!(
                "{}: entry while a position is already open",
                account.strategy
            )));
        }
        if intent.qty <= 0.0 || intent.price <= 0.0 {
            return Err(EngineError::InvariantViolated(format!(
                "{}: entry with qty {} at price {}",
                account.strategy, intent.qty, intent.price
            )));
        }

        let position_id = Uuid::new_v4().to_string();
        let fee = intent.notional * self.fee_rate;
        let liq_price = liquidation::liq_price(
            intent.side,
            intent.price,
            intent.qty,
            intent.margin,
            &self.tiers,
        );

        let position = Position {
            position_id: position_id.clone(),
            strategy: account.strategy.clone(),
            side: intent.side,
            qty: intent.qty,
            full_qty: intent.qty,
            entry_price: intent.price,
            entry_time_ms: intent.ts_ms,
            leverage: intent.leverage,
            margin: intent.margin,
            stop_price: intent.stop_price,
            tp1_price: intent.tp1_price,
            tp2_price: intent.tp2_price,
            status: PositionStatus::Open,
            realized_pnl: 0.0,
            fees_total: fee,
            liq_price,
            close_time_ms: None,
            close_reason: None,
        };

        let trade = Trade {
            trade_id: Uuid::new_v4().to_string(),
            position_id,
            strategy: account.strategy.clone(),
            side: entry_trade_side(intent.side),
            kind: TradeKind::Entry,
            price: intent.price,
            qty: intent.qty,
            notional: intent.notional,
            fee_amount: fee,
            fee_rate: self.fee_rate,
            ts_ms: intent.ts_ms,
            reason: "entry".to_string(),
        };

        account.balance -= fee;
        account.open_position = Some(position.clone());

        info!(
            strategy = %account.strategy,
            side = %intent.side,
            price = intent.price,
            qty = intent.qty,
            stop = intent.stop_price,
            tp1 = intent.tp1_price,
            tp2 = intent.tp2_price,
            liq = liq_price,
            "position opened"
        );

        let mut outcome = MatchOutcome::default();
        outcome.ledger.push(fee_entry(&account.strategy, fee, &trade.trade_id, intent.ts_ms));
        outcome.snapshots.push(snapshot(account, intent.price, intent.ts_ms));
        outcome.positions.push(position.clone());
        outcome.events.push(MatchEvent::Entry { position, trade: trade.clone() });
        outcome.trades.push(trade);
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    /// Close `qty_close` of the open position at `price`.
    pub fn close(
        &self,
        account: &mut Account,
        qty_close: f64,
        price: f64,
        reason: CloseReason,
        ts_ms: i64,
    ) -> Result<MatchOutcome, EngineError> {
        let Some(pos) = account.open_position.as_mut() else {
            return Err(EngineError::InvariantViolated(format!(
                "{}: close without an open position",
                account.strategy
            )));
        };
        if qty_close <= 0.0 || qty_close > pos.qty + QTY_EPSILON {
            return Err(EngineError::InvariantViolated(format!(
                "{}: close qty {} with {} remaining",
                account.strategy, qty_close, pos.qty
            )));
        }

        let direction = pos.side.direction();
        let realized = (price - pos.entry_price) * qty_close * direction;
        let notional = price * qty_close;
        let fee = notional * self.fee_rate;

        // Margin is released pro rata against the remaining reserve, which
        // equals entry_margin * qty_close / full_qty.
        let released = pos.margin * (qty_close / pos.qty);
        pos.margin -= released;
        pos.qty -= qty_close;
        pos.realized_pnl += realized;
        pos.fees_total += fee;

        let fully_closed = pos.qty <= QTY_EPSILON;
        if fully_closed {
            pos.qty = 0.0;
            pos.margin = 0.0;
            pos.status = PositionStatus::Closed;
            pos.close_time_ms = Some(ts_ms);
            pos.close_reason = Some(reason);
        }

        let trade = Trade {
            trade_id: Uuid::new_v4().to_string(),
            position_id: pos.position_id.clone(),
            strategy: account.strategy.clone(),
            side: exit_trade_side(pos.side),
            kind: TradeKind::Exit,
            price,
            qty: qty_close,
            notional,
            fee_amount: fee,
            fee_rate: self.fee_rate,
            ts_ms,
            reason: reason.to_string(),
        };

        let position = pos.clone();

        account.balance += realized - fee;
        if fully_closed {
            account.open_position = None;
        }

        info!(
            strategy = %account.strategy,
            reason = %reason,
            price,
            qty = qty_close,
            realized,
            fee,
            fully_closed,
            "position exit filled"
        );

        let mut outcome = MatchOutcome::default();
        outcome.ledger.push(fee_entry(&account.strategy, fee, &trade.trade_id, ts_ms));
        outcome.ledger.push(LedgerEntry {
            strategy: account.strategy.clone(),
            ts_ms,
            entry_type: LedgerType::RealizedPnl,
            amount: realized,
            r#ref: trade.trade_id.clone(),
            note: reason.to_string(),
        });
        outcome.snapshots.push(snapshot(account, price, ts_ms));
        outcome.positions.push(position.clone());
        outcome.events.push(match reason {
            CloseReason::Tp1 => MatchEvent::Tp1 { position, trade: trade.clone() },
            CloseReason::Tp2 => MatchEvent::Tp2 { position, trade: trade.clone() },
            CloseReason::Liq => MatchEvent::Liq { position, trade: trade.clone() },
            _ => MatchEvent::Exit { position, trade: trade.clone(), reason },
        });
        outcome.trades.push(trade);
        outcome.stop_out = fully_closed && reason == CloseReason::Stop;
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Preview management
    // -------------------------------------------------------------------------

    /// Run the protective-exit ladder against one in-progress bar.
    ///
    /// Check order: liquidation, then stop vs take-profits.  When both sides
    /// of the ladder fall inside the bar's range the bar direction picks the
    /// assumed path.
    pub fn manage_preview(&self, account: &mut Account, bar: &Bar) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();

        let Some(pos) = account.open_position.as_ref() else {
            return outcome;
        };

        let side = pos.side;
        let (liq, stop, tp1, tp2) = (pos.liq_price, pos.stop_price, pos.tp1_price, pos.tp2_price);
        let at_full = (pos.qty - pos.full_qty).abs() <= QTY_EPSILON;

        let adverse_extreme = match side {
            Side::Long => bar.low,
            Side::Short => bar.high,
        };
        let favorable_extreme = match side {
            Side::Long => bar.high,
            Side::Short => bar.low,
        };

        let crossed_down = |level: f64| match side {
            Side::Long => adverse_extreme <= level,
            Side::Short => adverse_extreme >= level,
        };
        let crossed_up = |level: f64| match side {
            Side::Long => favorable_extreme >= level,
            Side::Short => favorable_extreme <= level,
        };

        // 1. Liquidation dominates everything.
        if liq > 0.0 && crossed_down(liq) {
            let qty = pos.qty;
            match self.close(account, qty, liq, CloseReason::Liq, bar.close_time) {
                Ok(o) => outcome.merge(o),
                Err(e) => warn!(error = %e, "liquidation close failed"),
            }
            return outcome;
        }

        let stop_hit = crossed_down(stop);
        let tp_hit = crossed_up(tp1) || crossed_up(tp2);
        // A bar moving in the position's favor resolves the take-profit side
        // first; a bar moving against it resolves the stop first.
        let favorable_first = match side {
            Side::Long => bar.close > bar.open,
            Side::Short => bar.close < bar.open,
        };

        if stop_hit && !(tp_hit && favorable_first) {
            let qty = pos.qty;
            match self.close(account, qty, stop, CloseReason::Stop, bar.close_time) {
                Ok(o) => outcome.merge(o),
                Err(e) => warn!(error = %e, "stop close failed"),
            }
            return outcome;
        }

        // 3. TP1: close half the full quantity, move the stop to breakeven.
        if at_full && crossed_up(tp1) {
            let close_qty = pos.full_qty * TP1_CLOSE_FRACTION;
            let entry_price = pos.entry_price;
            match self.close(account, close_qty, tp1, CloseReason::Tp1, bar.close_time) {
                Ok(o) => {
                    outcome.merge(o);
                    if let Some(p) = account.open_position.as_mut() {
                        p.stop_price = entry_price;
                        outcome.positions.push(p.clone());
                        info!(
                            strategy = %account.strategy,
                            stop = entry_price,
                            "stop moved to breakeven after TP1"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "tp1 close failed"),
            }
        }

        // 4. TP2: close whatever remains.
        if let Some(pos) = account.open_position.as_ref() {
            if crossed_up(tp2) {
                let qty = pos.qty;
                match self.close(account, qty, tp2, CloseReason::Tp2, bar.close_time) {
                    Ok(o) => outcome.merge(o),
                    Err(e) => warn!(error = %e, "tp2 close failed"),
                }
            }
        }

        outcome
    }

    // -------------------------------------------------------------------------
    // Funding
    // -------------------------------------------------------------------------

    /// Apply one funding interval at `mark`.  Longs pay a positive rate,
    /// shorts receive it.
    pub fn apply_funding(
        &self,
        account: &mut Account,
        rate: f64,
        mark: f64,
        ts_ms: i64,
    ) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        let Some(pos) = account.open_position.as_ref() else {
            return outcome;
        };

        let notional = mark * pos.qty;
        let amount = -rate * notional * pos.side.direction();
        account.balance += amount;

        outcome.ledger.push(LedgerEntry {
            strategy: account.strategy.clone(),
            ts_ms,
            entry_type: LedgerType::Funding,
            amount,
            r#ref: ts_ms.to_string(),
            note: format!("funding rate {rate}"),
        });
        outcome.snapshots.push(snapshot(account, mark, ts_ms));
        outcome.events.push(MatchEvent::Funding { amount });
        outcome
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn entry_trade_side(side: Side) -> TradeSide {
    match side {
        Side::Long => TradeSide::Buy,
        Side::Short => TradeSide::Sell,
    }
}

fn exit_trade_side(side: Side) -> TradeSide {
    match side {
        Side::Long => TradeSide::Sell,
        Side::Short => TradeSide::Buy,
    }
}

fn fee_entry(strategy: &str, fee: f64, trade_id: &str, ts_ms: i64) -> LedgerEntry {
    LedgerEntry {
        strategy: strategy.to_string(),
        ts_ms,
        entry_type: LedgerType::Fee,
        amount: -fee,
        r#ref: trade_id.to_string(),
        note: "taker fee".to_string(),
    }
}

fn snapshot(account: &Account, mark: f64, ts_ms: i64) -> EquitySnapshot {
    EquitySnapshot {
        strategy: account.strategy.clone(),
        ts_ms,
        balance: account.balance,
        equity: account.equity(mark),
        upl: account.upl(mark),
        margin_used: account.margin_used(),
        free_margin: account.free_margin(mark),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;

    fn matcher() -> Matcher {
        Matcher::new(
            0.0004,
            vec![MmrTier { notional_cap: f64::MAX, mmr: 0.004, maint_amount: 0.0 }],
        )
    }

    fn long_intent(price: f64, qty: f64) -> EntryIntent {
        let notional = price * qty;
        EntryIntent {
            side: Side::Long,
            price,
            qty,
            notional,
            margin: notional / 5.0,
            leverage: 5.0,
            stop_price: price - 10.0,
            tp1_price: price + 10.0,
            tp2_price: price + 20.0,
            ts_ms: 1_000,
        }
    }

    fn preview_bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            interval: "15m".into(),
            open_time: 900_000,
            close_time: 1_799_999,
            open,
            high,
            low,
            close,
            volume: 10.0,
            trade_count: 5,
            closed: false,
            source: BarSource::Live,
        }
    }

    fn ledger_sum(entries: &[LedgerEntry]) -> f64 {
        entries.iter().map(|e| e.amount).sum()
    }

    #[test]
    fn entry_debits_fee_and_reserves_margin() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        let intent = long_intent(100.0, 2.0);

        let out = m.open(&mut acct, &intent).unwrap();

        let fee = 200.0 * 0.0004;
        assert!((acct.balance - (10_000.0 - fee)).abs() < 1e-9);
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].kind, TradeKind::Entry);
        assert_eq!(out.trades[0].side, TradeSide::Buy);
        assert_eq!(out.ledger.len(), 1);
        assert!((out.ledger[0].amount + fee).abs() < 1e-12);
        assert_eq!(out.snapshots.len(), 1);

        let pos = acct.open_position.as_ref().unwrap();
        assert!(pos.liq_price > 0.0 && pos.liq_price < 100.0);
        assert!((acct.margin_used() - 40.0).abs() < 1e-9);
        // At the decision price the snapshot identities hold.
        let snap = &out.snapshots[0];
        assert!((snap.equity - (snap.balance + snap.upl)).abs() < 1e-9);
        assert!((snap.free_margin - (snap.equity - snap.margin_used)).abs() < 1e-9);
    }

    #[test]
    fn double_entry_is_invariant_violation() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        m.open(&mut acct, &long_intent(100.0, 1.0)).unwrap();
        let err = m.open(&mut acct, &long_intent(100.0, 1.0));
        assert!(matches!(err, Err(EngineError::InvariantViolated(_))));
    }

    #[test]
    fn zero_qty_rejected() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        let mut intent = long_intent(100.0, 1.0);
        intent.qty = 0.0;
        assert!(matches!(
            m.open(&mut acct, &intent),
            Err(EngineError::InvariantViolated(_))
        ));
    }

    #[test]
    fn tp1_closes_half_and_moves_stop_to_breakeven() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        m.open(&mut acct, &long_intent(100.0, 2.0)).unwrap();

        // Up-bar tagging TP1 (110) but not TP2 (120).
        let out = m.manage_preview(&mut acct, &preview_bar(105.0, 111.0, 104.0, 110.0));

        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].kind, TradeKind::Exit);
        assert!((out.trades[0].qty - 1.0).abs() < 1e-9);
        assert!((out.trades[0].price - 110.0).abs() < 1e-9);

        let pos = acct.open_position.as_ref().unwrap();
        assert!((pos.qty - 1.0).abs() < 1e-9);
        assert!((pos.stop_price - 100.0).abs() < 1e-9, "stop must be at breakeven");
        assert!((pos.margin - 20.0).abs() < 1e-9, "half the margin released");

        // One positive realized_pnl row.
        let pnl: Vec<&LedgerEntry> = out
            .ledger
            .iter()
            .filter(|e| e.entry_type == LedgerType::RealizedPnl)
            .collect();
        assert_eq!(pnl.len(), 1);
        assert!((pnl[0].amount - 10.0).abs() < 1e-9);
    }

    #[test]
    fn breakeven_stop_after_tp1_nets_half_the_r() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        let intent = long_intent(100.0, 2.0);
        m.open(&mut acct, &intent).unwrap();

        let tp1 = m.manage_preview(&mut acct, &preview_bar(105.0, 110.5, 104.0, 110.0));
        assert!(!tp1.is_empty());

        // Price falls back to the breakeven stop; reason is still "stop", so
        // the cooldown flag is set.
        let stop = m.manage_preview(&mut acct, &preview_bar(104.0, 104.5, 99.0, 100.0));
        assert_eq!(stop.trades.len(), 1);
        assert!((stop.trades[0].price - 100.0).abs() < 1e-9);
        assert!(acct.open_position.is_none());
        assert!(stop.stop_out);

        // Net realized = 0.5 * (tp1 - entry) * full_qty = 10 (the breakeven
        // leg contributes zero), so the realized ledger rows sum to 10.
        let realized: f64 = tp1
            .ledger
            .iter()
            .chain(stop.ledger.iter())
            .filter(|e| e.entry_type == LedgerType::RealizedPnl)
            .map(|e| e.amount)
            .sum();
        assert!((realized - 10.0).abs() < 1e-9);

        // And the accounting identity holds including the entry fee.
        let entry_fee = 200.0 * 0.0004;
        let total_ledger: f64 = -entry_fee + ledger_sum(&tp1.ledger) + ledger_sum(&stop.ledger);
        assert!((acct.balance - (10_000.0 + total_ledger)).abs() < 1e-9);
    }

    #[test]
    fn down_bar_resolves_stop_before_tp() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        m.open(&mut acct, &long_intent(100.0, 2.0)).unwrap();

        // Wide down-bar spanning both stop (90) and TP1 (110).
        let out = m.manage_preview(&mut acct, &preview_bar(108.0, 111.0, 89.0, 92.0));

        assert_eq!(out.trades.len(), 1);
        assert!((out.trades[0].price - 90.0).abs() < 1e-9);
        assert_eq!(out.trades[0].reason, "stop");
        assert!(out.stop_out);
        assert!(acct.open_position.is_none());
    }

    #[test]
    fn up_bar_resolves_tp_before_stop() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        m.open(&mut acct, &long_intent(100.0, 2.0)).unwrap();

        // Wide up-bar spanning stop, TP1 and TP2: the whole position exits
        // on the profit side.
        let out = m.manage_preview(&mut acct, &preview_bar(95.0, 121.0, 89.0, 118.0));

        assert_eq!(out.trades.len(), 2);
        assert_eq!(out.trades[0].reason, "tp1");
        assert_eq!(out.trades[1].reason, "tp2");
        assert!(!out.stop_out);
        assert!(acct.open_position.is_none());
    }

    #[test]
    fn liquidation_dominates_stop() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        let mut intent = long_intent(100.0, 2.0);
        // Stop far below the liquidation price so liq must win.
        intent.stop_price = 1.0;
        m.open(&mut acct, &intent).unwrap();
        let liq = acct.open_position.as_ref().unwrap().liq_price;
        assert!(liq > 1.0);

        let out = m.manage_preview(&mut acct, &preview_bar(90.0, 91.0, liq - 0.5, 90.0));
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].reason, "liq");
        assert!((out.trades[0].price - liq).abs() < 1e-9);
        assert!(acct.open_position.is_none());
    }

    #[test]
    fn short_side_mirrors() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        let notional = 200.0;
        let intent = EntryIntent {
            side: Side::Short,
            price: 100.0,
            qty: 2.0,
            notional,
            margin: notional / 5.0,
            leverage: 5.0,
            stop_price: 110.0,
            tp1_price: 90.0,
            tp2_price: 80.0,
            ts_ms: 1_000,
        };
        let out = m.open(&mut acct, &intent).unwrap();
        assert_eq!(out.trades[0].side, TradeSide::Sell);
        assert!(acct.open_position.as_ref().unwrap().liq_price > 100.0);

        // Down-bar toward TP1 at 90.
        let out = m.manage_preview(&mut acct, &preview_bar(95.0, 96.0, 89.0, 90.0));
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].reason, "tp1");
        assert_eq!(out.trades[0].side, TradeSide::Buy);
        let pos = acct.open_position.as_ref().unwrap();
        assert!((pos.stop_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn trend_fail_close_is_plain_exit() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        m.open(&mut acct, &long_intent(100.0, 2.0)).unwrap();

        let qty = acct.open_position.as_ref().unwrap().qty;
        let out = m.close(&mut acct, qty, 97.0, CloseReason::TrendFail, 2_000).unwrap();

        assert!(!out.stop_out, "trend failure must not start the cooldown");
        assert!(acct.open_position.is_none());
        assert!(matches!(out.events[0], MatchEvent::Exit { reason: CloseReason::TrendFail, .. }));
        let pos_row = out.positions.last().unwrap();
        assert_eq!(pos_row.status, PositionStatus::Closed);
        assert_eq!(pos_row.close_reason, Some(CloseReason::TrendFail));
    }

    #[test]
    fn accounting_identity_over_full_lifecycle() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        let mut all_ledger: Vec<LedgerEntry> = Vec::new();

        let out = m.open(&mut acct, &long_intent(100.0, 2.0)).unwrap();
        all_ledger.extend(out.ledger);

        let out = m.manage_preview(&mut acct, &preview_bar(105.0, 110.5, 104.0, 110.0));
        all_ledger.extend(out.ledger);

        let out = m.manage_preview(&mut acct, &preview_bar(118.0, 121.0, 117.0, 120.5));
        all_ledger.extend(out.ledger);

        assert!(acct.open_position.is_none());
        assert!(
            (10_000.0 + ledger_sum(&all_ledger) - acct.balance).abs() < 1e-9,
            "initial + sum(ledger) must equal balance"
        );
    }

    #[test]
    fn exit_qty_sums_to_entry_qty() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);
        let mut exits = 0.0;

        let out = m.open(&mut acct, &long_intent(100.0, 2.0)).unwrap();
        let entry_qty = out.trades[0].qty;

        for o in [
            m.manage_preview(&mut acct, &preview_bar(105.0, 110.5, 104.0, 110.0)),
            m.manage_preview(&mut acct, &preview_bar(118.0, 121.0, 117.0, 120.5)),
        ] {
            exits += o
                .trades
                .iter()
                .filter(|t| t.kind == TradeKind::Exit)
                .map(|t| t.qty)
                .sum::<f64>();
        }

        assert!((exits - entry_qty).abs() < 1e-9);
    }

    #[test]
    fn funding_applies_to_open_position_only() {
        let m = matcher();
        let mut acct = Account::new("s1", 10_000.0);

        let none = m.apply_funding(&mut acct, 0.0001, 100.0, 1_000);
        assert!(none.is_empty());

        m.open(&mut acct, &long_intent(100.0, 2.0)).unwrap();
        let before = acct.balance;
        let out = m.apply_funding(&mut acct, 0.0001, 100.0, 2_000);
        assert_eq!(out.ledger.len(), 1);
        assert_eq!(out.ledger[0].entry_type, LedgerType::Funding);
        // Long pays positive funding.
        assert!(acct.balance < before);
    }
}
