// =============================================================================
// Persistence DAO — SQLite, append-only apart from position rows
// =============================================================================
//
// All writes are idempotent by natural keys:
//   * klines   — upsert on (symbol, interval, open_time)
//   * positions — insert on entry, update on partial/full close
//   * trades   — keyed by trade_id
//   * ledger / equity_snapshots / alerts — pure append
//   * app_state — key-value (resume marker lives here)
//
// A single writer task serializes all mutations; every other task enqueues
// DaoCommands.  Writes are retried with bounded backoff; after persistent
// failure the engine continues memory-only and an alert is raised.  Writes
// are not replayed when storage recovers.
//
// Reads go through lock-protected query methods on the shared handle.
// =============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertHub;
use crate::market_data::Bar;
use crate::sim::matcher::MatchOutcome;
use crate::sim::{Position, PositionStatus};
use crate::types::{
    BarSource, CloseReason, EquitySnapshot, LedgerEntry, LedgerType, Side, Trade, TradeKind,
    TradeSide,
};

/// Write attempts before the storage layer is declared gone.
const WRITE_RETRIES: u32 = 3;

/// Base backoff between write retries.
const WRITE_RETRY_DELAY_MS: u64 = 100;

/// Key of the restart discontinuity marker in app_state.
pub const RESUME_MARKER_KEY: &str = "resume_marker_ms";

// =============================================================================
// Commands
// =============================================================================

/// One serialized mutation for the writer task.
#[derive(Debug)]
pub enum DaoCommand {
    UpsertBar(Bar),
    UpsertPosition(Position),
    InsertTrade(Trade),
    InsertLedger(LedgerEntry),
    InsertEquity(EquitySnapshot),
    InsertAlert { ts_ms: i64, key: String, message: String },
    PutState { key: String, value: String },
    ResetStrategy { strategy: String },
}

// =============================================================================
// Dao
// =============================================================================

/// Owns the SQLite handle.  Mutations only through the writer task; reads
/// through the query methods below.
pub struct Dao {
    conn: Mutex<Connection>,
    memory_only: AtomicBool,
}

impl Dao {
    /// Open (or create) the database and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> anyhow::Result<Arc<Self>> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Arc<Self>> {
        conn.execute_batch(SCHEMA)?;
        info!("database schema ready");
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            memory_only: AtomicBool::new(false),
        }))
    }

    /// True once writes have been abandoned after persistent failure.
    pub fn is_memory_only(&self) -> bool {
        self.memory_only.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Mutations (writer task only)
    // -------------------------------------------------------------------------

    fn apply(&self, cmd: &DaoCommand) -> rusqlite::Result<()> {
        let conn = self.conn.lock();
        match cmd {
            DaoCommand::UpsertBar(bar) => {
                conn.execute(
                    "INSERT INTO klines
                       (symbol, interval, open_time, close_time,
                        open, high, low, close, volume, trade_count, source)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
                       close_time=excluded.close_time, open=excluded.open,
                       high=excluded.high, low=excluded.low, close=excluded.close,
                       volume=excluded.volume, trade_count=excluded.trade_count,
                       source=excluded.source",
                    params![
                        bar.symbol,
                        bar.interval,
                        bar.open_time,
                        bar.close_time,
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        bar.trade_count as i64,
                        bar.source.to_string(),
                    ],
                )?;
            }
            DaoCommand::UpsertPosition(pos) => {
                conn.execute(
                    "INSERT INTO positions
                       (position_id, strategy, side, qty, full_qty, entry_price,
                        entry_time, leverage, margin, stop_price, tp1_price,
                        tp2_price, status, realized_pnl, fees_total, liq_price,
                        close_time, close_reason)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)
                     ON CONFLICT(position_id) DO UPDATE SET
                       qty=excluded.qty, margin=excluded.margin,
                       stop_price=excluded.stop_price, status=excluded.status,
                       realized_pnl=excluded.realized_pnl,
                       fees_total=excluded.fees_total,
                       close_time=excluded.close_time,
                       close_reason=excluded.close_reason",
                    params![
                        pos.position_id,
                        pos.strategy,
                        pos.side.to_string(),
                        pos.qty,
                        pos.full_qty,
                        pos.entry_price,
                        pos.entry_time_ms,
                        pos.leverage,
                        pos.margin,
                        pos.stop_price,
                        pos.tp1_price,
                        pos.tp2_price,
                        pos.status.to_string(),
                        pos.realized_pnl,
                        pos.fees_total,
                        pos.liq_price,
                        pos.close_time_ms,
                        pos.close_reason.map(|r| r.to_string()),
                    ],
                )?;
            }
            DaoCommand::InsertTrade(t) => {
                conn.execute(
                    "INSERT OR IGNORE INTO trades
                       (trade_id, position_id, strategy, side, kind, price, qty,
                        notional, fee_amount, fee_rate, ts, reason)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    params![
                        t.trade_id,
                        t.position_id,
                        t.strategy,
                        t.side.to_string(),
                        t.kind.to_string(),
                        t.price,
                        t.qty,
                        t.notional,
                        t.fee_amount,
                        t.fee_rate,
                        t.ts_ms,
                        t.reason,
                    ],
                )?;
            }
            DaoCommand::InsertLedger(e) => {
                conn.execute(
                    "INSERT INTO ledger (strategy, ts, type, amount, ref, note)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    params![
                        e.strategy,
                        e.ts_ms,
                        e.entry_type.to_string(),
                        e.amount,
                        e.r#ref,
                        e.note,
                    ],
                )?;
            }
            DaoCommand::InsertEquity(s) => {
                conn.execute(
                    "INSERT INTO equity_snapshots
                       (strategy, ts, balance, equity, upl, margin_used, free_margin)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        s.strategy,
                        s.ts_ms,
                        s.balance,
                        s.equity,
                        s.upl,
                        s.margin_used,
                        s.free_margin,
                    ],
                )?;
            }
            DaoCommand::InsertAlert { ts_ms, key, message } => {
                conn.execute(
                    "INSERT INTO alerts (ts, key, message) VALUES (?1,?2,?3)",
                    params![ts_ms, key, message],
                )?;
            }
            DaoCommand::PutState { key, value } => {
                conn.execute(
                    "INSERT INTO app_state (key, value) VALUES (?1,?2)
                     ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                    params![key, value],
                )?;
            }
            DaoCommand::ResetStrategy { strategy } => {
                // Scoped destructive reset: one transaction, one strategy.
                conn.execute_batch(&format!(
                    "BEGIN;
                     DELETE FROM trades WHERE strategy = '{s}';
                     DELETE FROM ledger WHERE strategy = '{s}';
                     DELETE FROM equity_snapshots WHERE strategy = '{s}';
                     DELETE FROM positions WHERE strategy = '{s}';
                     COMMIT;",
                    s = strategy.replace('\'', "''"),
                ))?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Last `n` bars for an interval, oldest-first.
    pub fn klines_last(
        &self,
        symbol: &str,
        interval: &str,
        n: usize,
    ) -> rusqlite::Result<Vec<Bar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, interval, open_time, close_time, open, high, low,
                    close, volume, trade_count, source
             FROM klines
             WHERE symbol = ?1 AND interval = ?2
             ORDER BY open_time DESC LIMIT ?3",
        )?;
        let mut bars: Vec<Bar> = stmt
            .query_map(params![symbol, interval, n as i64], |row| {
                Ok(Bar {
                    symbol: row.get(0)?,
                    interval: row.get(1)?,
                    open_time: row.get(2)?,
                    close_time: row.get(3)?,
                    open: row.get(4)?,
                    high: row.get(5)?,
                    low: row.get(6)?,
                    close: row.get(7)?,
                    volume: row.get(8)?,
                    trade_count: row.get::<_, i64>(9)? as u64,
                    closed: true,
                    source: match row.get::<_, String>(10)?.as_str() {
                        "live" => BarSource::Live,
                        _ => BarSource::Warmup,
                    },
                })
            })?
            .collect::<Result<_, _>>()?;
        bars.reverse();
        Ok(bars)
    }

    pub fn kline_count(&self, symbol: &str, interval: &str) -> rusqlite::Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM klines WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval],
            |row| row.get(0),
        )
    }

    /// Positions still OPEN for a strategy, used by restart recovery.
    pub fn open_positions(&self, strategy: &str) -> rusqlite::Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT position_id, strategy, side, qty, full_qty, entry_price,
                    entry_time, leverage, margin, stop_price, tp1_price,
                    tp2_price, status, realized_pnl, fees_total, liq_price,
                    close_time, close_reason
             FROM positions WHERE strategy = ?1 AND status = 'OPEN'",
        )?;
        let result = stmt.query_map(params![strategy], |row| {
            Ok(Position {
                position_id: row.get(0)?,
                strategy: row.get(1)?,
                side: Side::parse(&row.get::<_, String>(2)?).unwrap_or(Side::Long),
                qty: row.get(3)?,
                full_qty: row.get(4)?,
                entry_price: row.get(5)?,
                entry_time_ms: row.get(6)?,
                leverage: row.get(7)?,
                margin: row.get(8)?,
                stop_price: row.get(9)?,
                tp1_price: row.get(10)?,
                tp2_price: row.get(11)?,
                status: match row.get::<_, String>(12)?.as_str() {
                    "CLOSED" => PositionStatus::Closed,
                    _ => PositionStatus::Open,
                },
                realized_pnl: row.get(13)?,
                fees_total: row.get(14)?,
                liq_price: row.get(15)?,
                close_time_ms: row.get(16)?,
                close_reason: row
                    .get::<_, Option<String>>(17)?
                    .as_deref()
                    .and_then(CloseReason::parse),
            })
        })?
        .collect();
        result
    }

    /// Paginated trades for a strategy, newest first.
    pub fn trades_page(
        &self,
        strategy: &str,
        limit: usize,
        offset: usize,
    ) -> rusqlite::Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trade_id, position_id, strategy, side, kind, price, qty,
                    notional, fee_amount, fee_rate, ts, reason
             FROM trades WHERE strategy = ?1
             ORDER BY ts DESC, trade_id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let result = stmt.query_map(params![strategy, limit as i64, offset as i64], |row| {
            Ok(Trade {
                trade_id: row.get(0)?,
                position_id: row.get(1)?,
                strategy: row.get(2)?,
                side: match row.get::<_, String>(3)?.as_str() {
                    "SELL" => TradeSide::Sell,
                    _ => TradeSide::Buy,
                },
                kind: match row.get::<_, String>(4)?.as_str() {
                    "EXIT" => TradeKind::Exit,
                    _ => TradeKind::Entry,
                },
                price: row.get(5)?,
                qty: row.get(6)?,
                notional: row.get(7)?,
                fee_amount: row.get(8)?,
                fee_rate: row.get(9)?,
                ts_ms: row.get(10)?,
                reason: row.get(11)?,
            })
        })?
        .collect();
        result
    }

    /// Paginated ledger rows for a strategy, newest first.
    pub fn ledger_page(
        &self,
        strategy: &str,
        limit: usize,
        offset: usize,
    ) -> rusqlite::Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT strategy, ts, type, amount, ref, note
             FROM ledger WHERE strategy = ?1
             ORDER BY ts DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let result = stmt.query_map(params![strategy, limit as i64, offset as i64], |row| {
            Ok(LedgerEntry {
                strategy: row.get(0)?,
                ts_ms: row.get(1)?,
                entry_type: match row.get::<_, String>(2)?.as_str() {
                    "realized_pnl" => LedgerType::RealizedPnl,
                    "funding" => LedgerType::Funding,
                    _ => LedgerType::Fee,
                },
                amount: row.get(3)?,
                r#ref: row.get(4)?,
                note: row.get(5)?,
            })
        })?
        .collect();
        result
    }

    /// Paginated equity snapshots for a strategy, newest first.
    pub fn equity_page(
        &self,
        strategy: &str,
        limit: usize,
        offset: usize,
    ) -> rusqlite::Result<Vec<EquitySnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT strategy, ts, balance, equity, upl, margin_used, free_margin
             FROM equity_snapshots WHERE strategy = ?1
             ORDER BY ts DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let result = stmt.query_map(params![strategy, limit as i64, offset as i64], |row| {
            Ok(EquitySnapshot {
                strategy: row.get(0)?,
                ts_ms: row.get(1)?,
                balance: row.get(2)?,
                equity: row.get(3)?,
                upl: row.get(4)?,
                margin_used: row.get(5)?,
                free_margin: row.get(6)?,
            })
        })?
        .collect();
        result
    }

    pub fn get_state(&self, key: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM app_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS klines (
    symbol      TEXT    NOT NULL,
    interval    TEXT    NOT NULL,
    open_time   INTEGER NOT NULL,
    close_time  INTEGER NOT NULL,
    open        REAL, high REAL, low REAL, close REAL,
    volume      REAL,
    trade_count INTEGER,
    source      TEXT,
    PRIMARY KEY (symbol, interval, open_time)
);
CREATE TABLE IF NOT EXISTS positions (
    position_id  TEXT PRIMARY KEY,
    strategy     TEXT NOT NULL,
    side         TEXT NOT NULL,
    qty          REAL, full_qty REAL,
    entry_price  REAL, entry_time INTEGER,
    leverage     REAL, margin REAL,
    stop_price   REAL, tp1_price REAL, tp2_price REAL,
    status       TEXT NOT NULL,
    realized_pnl REAL, fees_total REAL, liq_price REAL,
    close_time   INTEGER,
    close_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_positions_strategy ON positions(strategy, status);
CREATE TABLE IF NOT EXISTS trades (
    trade_id    TEXT PRIMARY KEY,
    position_id TEXT NOT NULL,
    strategy    TEXT NOT NULL,
    side        TEXT, kind TEXT,
    price       REAL, qty REAL, notional REAL,
    fee_amount  REAL, fee_rate REAL,
    ts          INTEGER,
    reason      TEXT
);
CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy, ts);
CREATE TABLE IF NOT EXISTS ledger (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy TEXT NOT NULL,
    ts       INTEGER,
    type     TEXT,
    amount   REAL,
    ref      TEXT,
    note     TEXT
);
CREATE INDEX IF NOT EXISTS idx_ledger_strategy ON ledger(strategy, ts);
CREATE TABLE IF NOT EXISTS equity_snapshots (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy    TEXT NOT NULL,
    ts          INTEGER,
    balance     REAL, equity REAL, upl REAL,
    margin_used REAL, free_margin REAL
);
CREATE INDEX IF NOT EXISTS idx_equity_strategy ON equity_snapshots(strategy, ts);
CREATE TABLE IF NOT EXISTS alerts (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    ts      INTEGER,
    key     TEXT,
    message TEXT
);
CREATE TABLE IF NOT EXISTS app_state (
    key   TEXT PRIMARY KEY,
    value TEXT
);
";

// =============================================================================
// Writer task & handle
// =============================================================================

/// Cloneable enqueue-side of the DAO plus the shared read handle.
#[derive(Clone)]
pub struct DaoHandle {
    tx: mpsc::UnboundedSender<DaoCommand>,
    dao: Arc<Dao>,
}

impl DaoHandle {
    /// Spawn the single writer task and return the handle.
    pub fn spawn(dao: Arc<Dao>, alerts: Arc<AlertHub>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(dao.clone(), rx, alerts));
        Self { tx, dao }
    }

    /// Read-side access.
    pub fn dao(&self) -> &Arc<Dao> {
        &self.dao
    }

    pub fn send(&self, cmd: DaoCommand) {
        if self.tx.send(cmd).is_err() {
            warn!("DAO writer task is gone; write dropped");
        }
    }

    pub fn upsert_bar(&self, bar: Bar) {
        self.send(DaoCommand::UpsertBar(bar));
    }

    pub fn put_state(&self, key: impl Into<String>, value: impl Into<String>) {
        self.send(DaoCommand::PutState { key: key.into(), value: value.into() });
    }

    pub fn reset_strategy(&self, strategy: impl Into<String>) {
        self.send(DaoCommand::ResetStrategy { strategy: strategy.into() });
    }

    pub fn insert_alert(&self, ts_ms: i64, key: impl Into<String>, message: impl Into<String>) {
        self.send(DaoCommand::InsertAlert {
            ts_ms,
            key: key.into(),
            message: message.into(),
        });
    }

    /// Enqueue every row a matcher operation produced, in emission order.
    pub fn apply_outcome(&self, outcome: &MatchOutcome) {
        for pos in &outcome.positions {
            self.send(DaoCommand::UpsertPosition(pos.clone()));
        }
        for trade in &outcome.trades {
            self.send(DaoCommand::InsertTrade(trade.clone()));
        }
        for entry in &outcome.ledger {
            self.send(DaoCommand::InsertLedger(entry.clone()));
        }
        for snap in &outcome.snapshots {
            self.send(DaoCommand::InsertEquity(snap.clone()));
        }
    }
}

/// The single writer: applies commands with bounded retry; on persistent
/// failure flips the DAO into memory-only mode and keeps draining so
/// producers never block.
async fn run_writer(
    dao: Arc<Dao>,
    mut rx: mpsc::UnboundedReceiver<DaoCommand>,
    alerts: Arc<AlertHub>,
) {
    info!("DAO writer task started");

    while let Some(cmd) = rx.recv().await {
        if dao.is_memory_only() {
            debug!("memory-only mode; write skipped");
            continue;
        }

        let mut applied = false;
        for attempt in 0..WRITE_RETRIES {
            if attempt > 0 {
                let delay = WRITE_RETRY_DELAY_MS * (1 << attempt);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            match dao.apply(&cmd) {
                Ok(()) => {
                    applied = true;
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "DAO write failed");
                }
            }
        }

        if !applied {
            error!("DAO writes failing persistently; continuing memory-only");
            dao.memory_only.store(true, Ordering::Relaxed);
            alerts.raise(
                "storage_failed",
                "database writes failing persistently; engine is memory-only",
            );
        }
    }

    info!("DAO writer task stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;

    fn bar(interval: &str, open_time: i64, close: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            interval: interval.into(),
            open_time,
            close_time: open_time + 899_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            trade_count: 5,
            closed: true,
            source: BarSource::Warmup,
        }
    }

    fn position(id: &str, strategy: &str, status: PositionStatus) -> Position {
        Position {
            position_id: id.into(),
            strategy: strategy.into(),
            side: Side::Long,
            qty: 1.0,
            full_qty: 1.0,
            entry_price: 100.0,
            entry_time_ms: 1_000,
            leverage: 5.0,
            margin: 20.0,
            stop_price: 95.0,
            tp1_price: 105.0,
            tp2_price: 110.0,
            status,
            realized_pnl: 0.0,
            fees_total: 0.1,
            liq_price: 81.0,
            close_time_ms: None,
            close_reason: None,
        }
    }

    fn trade(id: &str, strategy: &str, ts: i64) -> Trade {
        Trade {
            trade_id: id.into(),
            position_id: "p1".into(),
            strategy: strategy.into(),
            side: TradeSide::Buy,
            kind: TradeKind::Entry,
            price: 100.0,
            qty: 1.0,
            notional: 100.0,
            fee_amount: 0.04,
            fee_rate: 0.0004,
            ts_ms: ts,
            reason: "entry".into(),
        }
    }

    #[test]
    fn kline_upsert_is_idempotent() {
        let dao = Dao::open_in_memory().unwrap();

        // Same natural key applied twice: still one row (gap repair replays).
        dao.apply(&DaoCommand::UpsertBar(bar("15m", 0, 100.0))).unwrap();
        dao.apply(&DaoCommand::UpsertBar(bar("15m", 0, 101.0))).unwrap();
        dao.apply(&DaoCommand::UpsertBar(bar("15m", 900_000, 102.0))).unwrap();

        assert_eq!(dao.kline_count("BTCUSDT", "15m").unwrap(), 2);
        let bars = dao.klines_last("BTCUSDT", "15m", 10).unwrap();
        assert_eq!(bars.len(), 2);
        // The replay overwrote the close.
        assert!((bars[0].close - 101.0).abs() < 1e-9);
        assert_eq!(bars[0].open_time, 0);
        assert_eq!(bars[1].open_time, 900_000);
    }

    #[test]
    fn position_insert_then_update() {
        let dao = Dao::open_in_memory().unwrap();
        let mut pos = position("p1", "s1", PositionStatus::Open);
        dao.apply(&DaoCommand::UpsertPosition(pos.clone())).unwrap();

        assert_eq!(dao.open_positions("s1").unwrap().len(), 1);

        pos.qty = 0.0;
        pos.status = PositionStatus::Closed;
        pos.close_time_ms = Some(2_000);
        pos.close_reason = Some(CloseReason::Tp2);
        dao.apply(&DaoCommand::UpsertPosition(pos)).unwrap();

        assert!(dao.open_positions("s1").unwrap().is_empty());
    }

    #[test]
    fn duplicate_trade_id_ignored() {
        let dao = Dao::open_in_memory().unwrap();
        dao.apply(&DaoCommand::InsertTrade(trade("t1", "s1", 1_000))).unwrap();
        dao.apply(&DaoCommand::InsertTrade(trade("t1", "s1", 1_000))).unwrap();
        assert_eq!(dao.trades_page("s1", 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn pagination_is_newest_first() {
        let dao = Dao::open_in_memory().unwrap();
        for i in 0..5 {
            dao.apply(&DaoCommand::InsertTrade(trade(&format!("t{i}"), "s1", i * 1_000)))
                .unwrap();
        }
        let page = dao.trades_page("s1", 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].ts_ms, 4_000);
        assert_eq!(page[1].ts_ms, 3_000);

        let page = dao.trades_page("s1", 2, 4).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].ts_ms, 0);
    }

    #[test]
    fn reset_is_scoped_to_one_strategy() {
        let dao = Dao::open_in_memory().unwrap();
        for s in ["a", "b"] {
            dao.apply(&DaoCommand::InsertTrade(trade(&format!("t-{s}"), s, 1_000))).unwrap();
            dao.apply(&DaoCommand::UpsertPosition(position(
                &format!("p-{s}"),
                s,
                PositionStatus::Open,
            )))
            .unwrap();
            dao.apply(&DaoCommand::InsertLedger(LedgerEntry {
                strategy: s.into(),
                ts_ms: 1_000,
                entry_type: LedgerType::Fee,
                amount: -0.04,
                r#ref: "t".into(),
                note: "".into(),
            }))
            .unwrap();
            dao.apply(&DaoCommand::InsertEquity(EquitySnapshot {
                strategy: s.into(),
                ts_ms: 1_000,
                balance: 1.0,
                equity: 1.0,
                upl: 0.0,
                margin_used: 0.0,
                free_margin: 1.0,
            }))
            .unwrap();
        }

        dao.apply(&DaoCommand::ResetStrategy { strategy: "a".into() }).unwrap();

        assert!(dao.trades_page("a", 10, 0).unwrap().is_empty());
        assert!(dao.ledger_page("a", 10, 0).unwrap().is_empty());
        assert!(dao.equity_page("a", 10, 0).unwrap().is_empty());
        assert!(dao.open_positions("a").unwrap().is_empty());

        assert_eq!(dao.trades_page("b", 10, 0).unwrap().len(), 1);
        assert_eq!(dao.open_positions("b").unwrap().len(), 1);
    }

    #[test]
    fn app_state_roundtrip() {
        let dao = Dao::open_in_memory().unwrap();
        assert!(dao.get_state(RESUME_MARKER_KEY).unwrap().is_none());
        dao.apply(&DaoCommand::PutState {
            key: RESUME_MARKER_KEY.into(),
            value: "1700000000000".into(),
        })
        .unwrap();
        dao.apply(&DaoCommand::PutState {
            key: RESUME_MARKER_KEY.into(),
            value: "1700000001000".into(),
        })
        .unwrap();
        assert_eq!(
            dao.get_state(RESUME_MARKER_KEY).unwrap().as_deref(),
            Some("1700000001000")
        );
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vela.db");

        {
            let dao = Dao::open(&path).unwrap();
            dao.apply(&DaoCommand::UpsertPosition(position("p1", "s1", PositionStatus::Open)))
                .unwrap();
        }

        let dao = Dao::open(&path).unwrap();
        let open = dao.open_positions("s1").unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].position_id, "p1");
        assert_eq!(open[0].side, Side::Long);
    }
}
