// =============================================================================
// Strategy Engine — instance state, event routing, quarantine
// =============================================================================
//
// Every configured strategy instance owns its account, matcher and indicator
// sets outright; one task per instance consumes the market event broadcast.
// Nothing here is shared mutably across instances — outside readers only see
// the snapshots the instance publishes into its StrategyShared.
//
// Stage order within one bar event is fixed: the buffer was updated by the
// source before the broadcast, so here it is Indicators -> Strategy ->
// Matcher -> DAO enqueue -> Fan-out publish.
//
// Commits that land simultaneously on several intervals are evaluated
// shorter-interval first: a higher-timeframe commit that arrives before the
// matching execution-interval commit is stashed and applied right after it.
// =============================================================================

pub mod trend_pullback;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

use crate::alerts::AlertHub;
use crate::error::EngineError;
use crate::fanout::{FanoutHub, StreamEvent, StreamFrame};
use crate::indicators::{IndicatorSet, IndicatorSnapshot};
use crate::market_data::{interval_ms, Bar, BarEvent, KlineBuffer};
use crate::runtime_config::{RuntimeConfig, StrategyInstanceConfig};
use crate::sim::matcher::{MatchEvent, MatchOutcome, Matcher};
use crate::sim::{Account, AccountView, Position};
use crate::store::DaoHandle;
use crate::types::{BarSource, CloseReason};

use trend_pullback::{ConditionChecklist, SizingLimits, TrendPullback};

/// Committed snapshots retained per (strategy, interval) for the history API.
const HISTORY_DEPTH: usize = 512;

// =============================================================================
// Shared views & commands
// =============================================================================

/// Control messages delivered to a running instance.
#[derive(Debug)]
pub enum StrategyCommand {
    /// Wipe this strategy's rows and reset the in-memory account.
    Reset,
}

/// Immutable-snapshot surface of one instance.  Written only by that
/// instance's task; everyone else reads.
pub struct StrategyShared {
    pub id: String,
    pub strategy_type: String,
    pub status: RwLock<AccountView>,
    pub checklist: RwLock<Option<ConditionChecklist>>,
    pub history: RwLock<HashMap<String, VecDeque<IndicatorSnapshot>>>,
    pub quarantined: RwLock<bool>,
    commands: mpsc::UnboundedSender<StrategyCommand>,
}

impl StrategyShared {
    pub fn send_command(&self, cmd: StrategyCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }

    /// Last `n` committed snapshots for an interval, oldest-first.
    pub fn history_last(&self, interval: &str, n: usize) -> Vec<IndicatorSnapshot> {
        let map = self.history.read();
        match map.get(interval) {
            Some(ring) => {
                let start = ring.len().saturating_sub(n);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

// =============================================================================
// Instance
// =============================================================================

/// One running strategy: logic + account + indicator state.
pub struct StrategyInstance {
    id: String,
    logic: TrendPullback,
    account: Account,
    matcher: Matcher,
    sets: HashMap<String, IndicatorSet>,
    buffer: Arc<KlineBuffer>,
    dao: DaoHandle,
    fanout: Arc<FanoutHub>,
    alerts: Arc<AlertHub>,
    shared: Arc<StrategyShared>,

    initial_capital: f64,
    exec_interval: String,
    htf_interval: String,
    funding_enabled: bool,
    funding_rate: f64,
    funding_step_ms: i64,
    next_funding_ms: Option<i64>,

    /// Higher-timeframe commits waiting for their simultaneous exec commit,
    /// in arrival order.
    pending_htf: VecDeque<Bar>,
    last_exec_commit_close: i64,
    last_price: f64,
    quarantined: bool,
}

impl StrategyInstance {
    pub fn new(
        config: &RuntimeConfig,
        inst: &StrategyInstanceConfig,
        buffer: Arc<KlineBuffer>,
        dao: DaoHandle,
        fanout: Arc<FanoutHub>,
        alerts: Arc<AlertHub>,
    ) -> (Self, Arc<StrategyShared>, mpsc::UnboundedReceiver<StrategyCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let limits = SizingLimits {
            max_position_notional: config.max_position_notional,
            max_position_pct_equity: config.max_position_pct_equity,
            leverage: config.max_leverage,
        };
        let logic = TrendPullback::new(inst.params.clone(), limits);
        let account = Account::new(&inst.id, config.initial_capital);

        let mut sets = HashMap::new();
        let mut history = HashMap::new();
        for interval in &config.intervals {
            sets.insert(interval.clone(), IndicatorSet::new(&config.indicators));
            history.insert(interval.clone(), VecDeque::with_capacity(HISTORY_DEPTH));
        }

        let shared = Arc::new(StrategyShared {
            id: inst.id.clone(),
            strategy_type: inst.strategy_type.clone(),
            status: RwLock::new(account.view(0.0)),
            checklist: RwLock::new(None),
            history: RwLock::new(history),
            quarantined: RwLock::new(false),
            commands: cmd_tx,
        });

        let funding_step_ms = i64::from(config.funding.interval_hours).max(1) * 3_600_000;

        let instance = Self {
            id: inst.id.clone(),
            logic,
            account,
            matcher: Matcher::new(config.fee_rate, config.mmr_tiers.clone()),
            sets,
            buffer,
            dao,
            fanout,
            alerts,
            shared: shared.clone(),
            initial_capital: config.initial_capital,
            exec_interval: inst.params.exec_interval.clone(),
            htf_interval: inst.params.htf_interval.clone(),
            funding_enabled: config.funding.enabled,
            funding_rate: config.funding.rate,
            funding_step_ms,
            next_funding_ms: None,
            pending_htf: VecDeque::new(),
            last_exec_commit_close: 0,
            last_price: 0.0,
            quarantined: false,
        };

        (instance, shared, cmd_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Restart recovery: adopt a position that was OPEN at shutdown.  Missed
    /// ticks are not simulated; management resumes from the next live price.
    pub fn restore_position(&mut self, position: Position) {
        info!(
            strategy = %self.id,
            position_id = %position.position_id,
            side = %position.side,
            "restored open position from storage"
        );
        self.last_price = position.entry_price;
        self.account.open_position = Some(position);
        self.publish_status();
    }

    /// Restart recovery: adopt the persisted balance so the accounting
    /// identity spans restarts.
    pub fn restore_balance(&mut self, balance: f64) {
        self.account.balance = balance;
        self.publish_status();
    }

    // -------------------------------------------------------------------------
    // Event routing
    // -------------------------------------------------------------------------

    pub fn handle_event(&mut self, event: &BarEvent) {
        if self.quarantined {
            return;
        }
        let bar = event.bar();
        if !self.sets.contains_key(&bar.interval) {
            return;
        }
        match event {
            BarEvent::Commit(bar) => self.on_commit(bar),
            BarEvent::Preview(bar) => self.on_preview(bar),
        }
    }

    pub fn handle_command(&mut self, cmd: StrategyCommand) {
        match cmd {
            StrategyCommand::Reset => {
                info!(strategy = %self.id, "resetting strategy state");
                self.dao.reset_strategy(&self.id);
                self.account = Account::new(&self.id, self.initial_capital);
                self.quarantined = false;
                *self.shared.quarantined.write() = false;
                self.publish_status();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commits
    // -------------------------------------------------------------------------

    fn on_commit(&mut self, bar: &Bar) {
        if bar.interval == self.exec_interval {
            self.on_exec_commit(bar);
        } else if bar.interval == self.htf_interval {
            // Shorter interval first: hold the commit back until the exec
            // commit for the same boundary has been processed.
            if self.pending_htf.is_empty() && self.last_exec_commit_close >= bar.close_time {
                self.apply_htf_commit(bar);
            } else {
                self.pending_htf.push_back(bar.clone());
            }
        } else {
            // Tracked but not traded: indicators and history only.
            let snap = self.commit_indicators(bar);
            self.publish_frame(bar, Some(snap), None, Vec::new());
        }
    }

    fn on_exec_commit(&mut self, bar: &Bar) {
        let snap = self.commit_indicators(bar);
        self.last_exec_commit_close = bar.close_time;
        self.last_price = bar.close;

        let mut events = Vec::new();

        // Trend-failure exit comes before any entry consideration.
        let trend_exit_qty = self
            .account
            .open_position
            .as_ref()
            .filter(|pos| self.logic.trend_failed(pos.side, bar, &snap))
            .map(|pos| pos.qty);
        if let Some(qty) = trend_exit_qty {
            match self.matcher.close(
                &mut self.account,
                qty,
                bar.close,
                CloseReason::TrendFail,
                bar.close_time,
            ) {
                Ok(outcome) => events.extend(self.absorb_outcome(outcome, bar)),
                Err(e) => {
                    self.quarantine(e);
                    return;
                }
            }
        }

        // Entry: flat, outside cooldown, and never on a replayed bar (the
        // decision price of warmup/repair bars is stale).
        if self.account.open_position.is_none()
            && !self.account.in_cooldown(bar.close_time)
            && bar.source == BarSource::Live
        {
            let window = self.hist_window(None);
            if let Some(side) = self.logic.entry_side(bar, &snap, &window) {
                let view = self.account.view(bar.close);
                let swing = self
                    .buffer
                    .last_closed(&self.exec_interval, self.logic.params().swing_lookback);
                if let Some(intent) = self.logic.build_entry(side, bar, &snap, &view, &swing) {
                    match self.matcher.open(&mut self.account, &intent) {
                        Ok(outcome) => events.extend(self.absorb_outcome(outcome, bar)),
                        Err(e) => {
                            self.quarantine(e);
                            return;
                        }
                    }
                }
            }
        }

        self.publish_frame(bar, Some(snap), None, events);
        self.publish_status();

        // Held-back higher-timeframe commits up to this boundary apply now,
        // in order.
        while self
            .pending_htf
            .front()
            .is_some_and(|pending| pending.close_time <= bar.close_time)
        {
            let pending = self.pending_htf.pop_front().expect("front checked");
            self.apply_htf_commit(&pending);
        }
    }

    fn apply_htf_commit(&mut self, bar: &Bar) {
        let snap = self.commit_indicators(bar);
        self.logic.on_htf_commit(bar, &snap);
        self.publish_frame(bar, Some(snap), None, Vec::new());
    }

    fn commit_indicators(&mut self, bar: &Bar) -> IndicatorSnapshot {
        let set = self
            .sets
            .get_mut(&bar.interval)
            .expect("interval checked by handle_event");
        let snap = set.commit(bar);

        let mut history = self.shared.history.write();
        if let Some(ring) = history.get_mut(&bar.interval) {
            // Gap-repair replays can re-commit an open_time already recorded.
            if ring.back().map(|s| s.open_time) != Some(snap.open_time) {
                ring.push_back(snap.clone());
                while ring.len() > HISTORY_DEPTH {
                    ring.pop_front();
                }
            } else {
                *ring.back_mut().expect("ring is non-empty") = snap.clone();
            }
        }
        snap
    }

    // -------------------------------------------------------------------------
    // Previews
    // -------------------------------------------------------------------------

    fn on_preview(&mut self, bar: &Bar) {
        let snap = self
            .sets
            .get(&bar.interval)
            .expect("interval checked by handle_event")
            .preview(bar);

        if bar.interval != self.exec_interval {
            self.publish_frame(bar, Some(snap), None, Vec::new());
            return;
        }

        self.last_price = bar.close;
        let mut events = Vec::new();

        // Funding settles on the execution clock.
        if self.funding_enabled {
            let due = *self.next_funding_ms.get_or_insert_with(|| {
                (bar.close_time / self.funding_step_ms + 1) * self.funding_step_ms
            });
            if bar.close_time >= due {
                let outcome = self.matcher.apply_funding(
                    &mut self.account,
                    self.funding_rate,
                    bar.close,
                    due,
                );
                events.extend(self.absorb_outcome(outcome, bar));
                self.next_funding_ms = Some(due + self.funding_step_ms);
            }
        }

        // Protective exits: liquidation, stop, TP1, TP2.
        let outcome = self.matcher.manage_preview(&mut self.account, bar);
        events.extend(self.absorb_outcome(outcome, bar));

        let window = self.hist_window(snap.macd_hist);
        let checklist = self.logic.checklist(
            &self.id,
            bar,
            &snap,
            &window,
            self.account.in_cooldown(bar.close_time),
            self.account.open_position.is_some(),
        );
        *self.shared.checklist.write() = Some(checklist.clone());

        self.publish_frame(bar, Some(snap), Some(checklist), events);
        self.publish_status();
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    /// Forward a matcher outcome to the DAO, convert its events for the
    /// stream, and start the cooldown on a stop-out.
    fn absorb_outcome(&mut self, outcome: MatchOutcome, bar: &Bar) -> Vec<StreamEvent> {
        if outcome.is_empty() && outcome.positions.is_empty() {
            return Vec::new();
        }

        self.dao.apply_outcome(&outcome);

        if outcome.stop_out {
            let step = interval_ms(&self.exec_interval).unwrap_or(900_000);
            let bars = i64::from(self.logic.params().cooldown_after_stop);
            self.account.cooldown_until_ms = Some(bar.close_time + bars * step);
            info!(
                strategy = %self.id,
                until = self.account.cooldown_until_ms,
                "cooldown started after stop-out"
            );
        }

        outcome
            .events
            .into_iter()
            .map(|ev| {
                let kind = ev.kind().to_string();
                match ev {
                    MatchEvent::Entry { position, trade }
                    | MatchEvent::Tp1 { position, trade }
                    | MatchEvent::Tp2 { position, trade }
                    | MatchEvent::Liq { position, trade }
                    | MatchEvent::Exit { position, trade, .. } => StreamEvent {
                        kind,
                        trade: Some(trade),
                        position: Some(position),
                    },
                    MatchEvent::Funding { .. } => StreamEvent {
                        kind,
                        trade: None,
                        position: None,
                    },
                }
            })
            .collect()
    }

    fn publish_frame(
        &self,
        bar: &Bar,
        snap: Option<IndicatorSnapshot>,
        cond: Option<ConditionChecklist>,
        events: Vec<StreamEvent>,
    ) {
        let mut frame = StreamFrame::new(&self.id);
        frame.k = Some(bar.clone());
        frame.i = snap;
        frame.cond = cond;
        frame.ev = events;
        self.fanout.publish_stream(&frame);
    }

    fn publish_status(&self) {
        let view = self.account.view(self.last_price);
        *self.shared.status.write() = view.clone();
        self.fanout.publish_status(&self.id, &view);
    }

    /// Committed MACD histogram values for the execution interval, newest
    /// last; `extra` appends a transient preview value.
    fn hist_window(&self, extra: Option<f64>) -> Vec<f64> {
        let mut window: Vec<f64> = self
            .shared
            .history
            .read()
            .get(&self.exec_interval)
            .map(|ring| {
                ring.iter()
                    .rev()
                    .take(4)
                    .filter_map(|s| s.macd_hist)
                    .collect::<Vec<f64>>()
            })
            .unwrap_or_default();
        window.reverse();
        if let Some(h) = extra {
            window.push(h);
        }
        window
    }

    /// Freeze this instance after a broken invariant; everyone else keeps
    /// running.
    fn quarantine(&mut self, err: EngineError) {
        error!(strategy = %self.id, error = %err, "strategy quarantined");
        self.quarantined = true;
        *self.shared.quarantined.write() = true;
        self.alerts.raise(
            format!("quarantine_{}", self.id),
            format!("strategy {} quarantined: {err}", self.id),
        );
    }
}

// =============================================================================
// Task loop
// =============================================================================

/// Drive one instance until shutdown.  The instance reacts to market events
/// and control commands; everything else is passive.
pub async fn run_instance(
    mut instance: StrategyInstance,
    mut events: broadcast::Receiver<BarEvent>,
    mut commands: mpsc::UnboundedReceiver<StrategyCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(strategy = %instance.id(), "strategy task started");

    loop {
        tokio::select! {
            res = events.recv() => match res {
                Ok(event) => instance.handle_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(strategy = %instance.id(), skipped = n, "strategy lagged behind the bar stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(cmd) = commands.recv() => instance.handle_command(cmd),
            _ = shutdown.changed() => {
                // Drain whatever is already queued, then stop.
                while let Ok(event) = events.try_recv() {
                    instance.handle_event(&event);
                }
                break;
            }
        }
    }

    info!(strategy = %instance.id(), "strategy task stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::PushInterval;
    use crate::runtime_config::{AlertConfig, StrategyParams};
    use crate::store::Dao;
    use crate::types::{BarSource, Side};

    fn test_config() -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.initial_capital = 10_000.0;
        cfg.intervals = vec!["15m".into(), "1h".into()];
        cfg.strategies = vec![
            StrategyInstanceConfig {
                id: "alpha".into(),
                strategy_type: "trend_pullback".into(),
                params: StrategyParams {
                    rsi_long_hi: 100.0,
                    rsi_slope_required: false,
                    ..StrategyParams::default()
                },
            },
            StrategyInstanceConfig {
                id: "beta".into(),
                strategy_type: "trend_pullback".into(),
                params: StrategyParams {
                    rsi_long_hi: 100.0,
                    rsi_slope_required: false,
                    atr_stop_mult: 3.0,
                    ..StrategyParams::default()
                },
            },
        ];
        cfg.default_strategy = "alpha".into();
        cfg
    }

    struct Harness {
        buffer: Arc<KlineBuffer>,
        instances: Vec<StrategyInstance>,
    }

    async fn harness(cfg: &RuntimeConfig) -> Harness {
        let alerts = AlertHub::new(&AlertConfig { enabled: false, webhook_url: None, dedup_ttl_ms: 0 });
        let dao = DaoHandle::spawn(Dao::open_in_memory().unwrap(), alerts.clone());
        let fanout = Arc::new(FanoutHub::new(PushInterval::Raw));
        let buffer = Arc::new(KlineBuffer::new(cfg.buffer_capacity()));

        let instances = cfg
            .strategies
            .iter()
            .map(|inst| {
                let (instance, _shared, _rx) = StrategyInstance::new(
                    cfg,
                    inst,
                    buffer.clone(),
                    dao.clone(),
                    fanout.clone(),
                    alerts.clone(),
                );
                instance
            })
            .collect();

        Harness { buffer, instances }
    }

    fn bar(interval: &str, idx: i64, open: f64, high: f64, low: f64, close: f64, source: BarSource) -> Bar {
        let step = interval_ms(interval).unwrap();
        Bar {
            symbol: "BTCUSDT".into(),
            interval: interval.into(),
            open_time: idx * step,
            close_time: (idx + 1) * step - 1,
            open,
            high,
            low,
            close,
            volume: 10.0,
            trade_count: 5,
            closed: true,
            source,
        }
    }

    impl Harness {
        fn commit(&mut self, bar: Bar) {
            self.buffer.append_or_replace_last(bar.clone()).unwrap();
            let event = BarEvent::Commit(bar);
            for inst in &mut self.instances {
                inst.handle_event(&event);
            }
        }

        fn preview(&mut self, mut bar: Bar) {
            bar.closed = false;
            self.buffer.append_or_replace_last(bar.clone()).unwrap();
            let event = BarEvent::Preview(bar);
            for inst in &mut self.instances {
                inst.handle_event(&event);
            }
        }
    }

    /// Accelerating uptrend keeps the MACD histogram rising while RSI pegs
    /// high; rsi_long_hi=100 in the test params admits it.
    fn uptrend_close(i: i64) -> f64 {
        100.0 * (1.0 + 0.002f64).powi(i as i32)
    }

    async fn warmed_harness(source: BarSource) -> Harness {
        let cfg = test_config();
        let mut h = harness(&cfg).await;

        for i in 0..300 {
            let c = uptrend_close(i);
            let prev = uptrend_close(i - 1);
            h.commit(bar("15m", i, prev, c.max(prev) + 0.05, prev.min(c) - 0.05, c, source));
            if (i + 1) % 4 == 0 {
                let j = (i + 1) / 4 - 1;
                let c1h = uptrend_close(i);
                let p1h = uptrend_close(i - 3);
                h.commit(bar("1h", j, p1h, c1h + 0.1, p1h - 0.1, c1h, source));
            }
        }
        h
    }

    #[tokio::test]
    async fn warmup_uptrend_produces_no_trades() {
        let h = warmed_harness(BarSource::Warmup).await;

        for inst in &h.instances {
            let status = inst.shared.status.read().clone();
            assert!(status.position.is_none(), "no trades during warmup");
            assert_eq!(status.balance, 10_000.0);

            let hist = inst.shared.history_last("15m", 1);
            let snap = hist.last().unwrap();
            assert!(snap.ema_fast.unwrap() > snap.ema_slow.unwrap());
            assert!(snap.rsi.unwrap() > 60.0);
        }
    }

    #[tokio::test]
    async fn live_pullback_bar_opens_a_long() {
        let mut h = warmed_harness(BarSource::Live).await;

        // Build the entry bar from the last committed snapshot: the low tags
        // the fast EMA, the close keeps the trend.
        let snap = h.instances[0].shared.history_last("15m", 1)[0].clone();
        let ema_fast = snap.ema_fast.unwrap();
        let close = uptrend_close(300);
        h.commit(bar("15m", 300, uptrend_close(299), close + 0.1, ema_fast - 0.5, close, BarSource::Live));

        for inst in &h.instances {
            let status = inst.shared.status.read().clone();
            let pos = status.position.expect("pullback entry expected");
            assert_eq!(pos.side, Side::Long);
            assert!(pos.qty > 0.0);
            assert!(pos.stop_price < pos.entry_price);
            let r = pos.entry_price - pos.stop_price;
            assert!((pos.tp1_price - (pos.entry_price + r)).abs() < 1e-9);
            assert!((pos.tp2_price - (pos.entry_price + 2.0 * r)).abs() < 1e-9);
            // Entry fee debited from the balance.
            assert!(status.balance < 10_000.0);
        }

        // Strategies sized identically but stop distances differ with
        // atr_stop_mult, so the two instances diverge.
        let a = h.instances[0].shared.status.read().position.clone().unwrap();
        let b = h.instances[1].shared.status.read().position.clone().unwrap();
        assert!(b.stop_price <= a.stop_price, "wider ATR multiple -> wider stop");
    }

    #[tokio::test]
    async fn tp1_then_breakeven_stop_via_previews() {
        let mut h = warmed_harness(BarSource::Live).await;

        let snap = h.instances[0].shared.history_last("15m", 1)[0].clone();
        let ema_fast = snap.ema_fast.unwrap();
        let close = uptrend_close(300);
        h.commit(bar("15m", 300, uptrend_close(299), close + 0.1, ema_fast - 0.5, close, BarSource::Live));

        let entry = h.instances[0].shared.status.read().position.clone().unwrap();

        // Preview crossing TP1: half out, stop to breakeven.
        let tp1 = entry.tp1_price;
        h.preview(bar("15m", 301, close, tp1 + 0.1, close - 0.1, tp1 + 0.05, BarSource::Live));
        {
            let pos = h.instances[0].shared.status.read().position.clone().unwrap();
            assert!((pos.qty - entry.qty / 2.0).abs() < 1e-9);
            assert!((pos.stop_price - entry.entry_price).abs() < 1e-9);
        }

        // Preview falling back to the breakeven stop: flat.
        h.preview(bar(
            "15m",
            301,
            tp1,
            tp1 + 0.2,
            entry.entry_price - 0.2,
            entry.entry_price - 0.1,
            BarSource::Live,
        ));
        let status = h.instances[0].shared.status.read().clone();
        assert!(status.position.is_none());
        // Realized 0.5 * R * qty minus fees.
        let r = entry.entry_price - entry.stop_price;
        let expected = 0.5 * entry.qty * r;
        assert!(
            status.balance > 10_000.0 && status.balance < 10_000.0 + expected,
            "profit booked net of fees, got {}",
            status.balance
        );
    }

    #[tokio::test]
    async fn instances_are_isolated_and_reset_is_scoped() {
        let mut h = warmed_harness(BarSource::Live).await;

        let snap = h.instances[0].shared.history_last("15m", 1)[0].clone();
        let ema_fast = snap.ema_fast.unwrap();
        let close = uptrend_close(300);
        h.commit(bar("15m", 300, uptrend_close(299), close + 0.1, ema_fast - 0.5, close, BarSource::Live));

        assert!(h.instances[0].shared.status.read().position.is_some());
        assert!(h.instances[1].shared.status.read().position.is_some());

        // Reset alpha only.
        h.instances[0].handle_command(StrategyCommand::Reset);

        let alpha = h.instances[0].shared.status.read().clone();
        let beta = h.instances[1].shared.status.read().clone();
        assert!(alpha.position.is_none());
        assert_eq!(alpha.balance, 10_000.0);
        assert!(beta.position.is_some(), "reset must not leak across strategies");
    }

    #[tokio::test]
    async fn trend_failure_closes_without_cooldown() {
        let mut h = warmed_harness(BarSource::Live).await;

        let snap = h.instances[0].shared.history_last("15m", 1)[0].clone();
        let ema_fast = snap.ema_fast.unwrap();
        let close = uptrend_close(300);
        h.commit(bar("15m", 300, uptrend_close(299), close + 0.1, ema_fast - 0.5, close, BarSource::Live));
        assert!(h.instances[0].shared.status.read().position.is_some());

        // A hard down commit: close far below the fast EMA drags RSI under 50.
        let crash = ema_fast * 0.97;
        h.commit(bar("15m", 301, close, close + 0.1, crash - 0.5, crash, BarSource::Live));

        let inst = &h.instances[0];
        assert!(inst.shared.status.read().position.is_none(), "trend failure must exit");
        assert!(
            inst.account.cooldown_until_ms.is_none(),
            "cooldown applies to stop-outs only"
        );
    }

    #[tokio::test]
    async fn stop_out_starts_cooldown_and_blocks_reentry() {
        let mut h = warmed_harness(BarSource::Live).await;

        let snap = h.instances[0].shared.history_last("15m", 1)[0].clone();
        let ema_fast = snap.ema_fast.unwrap();
        let close = uptrend_close(300);
        h.commit(bar("15m", 300, uptrend_close(299), close + 0.1, ema_fast - 0.5, close, BarSource::Live));

        let entry = h.instances[0].shared.status.read().position.clone().unwrap();

        // Down preview through the stop.
        h.preview(bar(
            "15m",
            301,
            close,
            close + 0.05,
            entry.stop_price - 0.5,
            entry.stop_price - 0.2,
            BarSource::Live,
        ));

        let inst = &h.instances[0];
        assert!(inst.shared.status.read().position.is_none());
        let until = inst.account.cooldown_until_ms.expect("cooldown after stop-out");
        assert!(until > 0);
    }
}
