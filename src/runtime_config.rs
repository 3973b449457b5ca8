// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Vela paper-trading engine.  Every tunable
// parameter lives here so that deployments can be reconfigured without a
// rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_intervals() -> Vec<String> {
    vec!["15m".to_string(), "1h".to_string()]
}

fn default_initial_capital() -> f64 {
    10_000.0
}

fn default_max_leverage() -> f64 {
    5.0
}

fn default_fee_rate() -> f64 {
    0.0004
}

fn default_ema_fast() -> usize {
    20
}

fn default_ema_slow() -> usize {
    50
}

fn default_rsi_length() -> usize {
    14
}

fn default_macd_fast() -> usize {
    12
}

fn default_macd_slow() -> usize {
    26
}

fn default_macd_signal() -> usize {
    9
}

fn default_atr_length() -> usize {
    14
}

fn default_trend_strength_min() -> f64 {
    0.001
}

fn default_atr_stop_mult() -> f64 {
    1.5
}

fn default_cooldown_after_stop() -> u32 {
    4
}

fn default_rsi_long_lo() -> f64 {
    40.0
}

fn default_rsi_long_hi() -> f64 {
    65.0
}

fn default_rsi_short_lo() -> f64 {
    35.0
}

fn default_rsi_short_hi() -> f64 {
    60.0
}

fn default_true() -> bool {
    true
}

fn default_swing_lookback() -> usize {
    10
}

fn default_max_position_notional() -> f64 {
    50_000.0
}

fn default_max_position_pct_equity() -> f64 {
    0.25
}

fn default_mmr_tiers() -> Vec<MmrTier> {
    // Binance-style USDT-perp maintenance schedule (first tiers).
    vec![
        MmrTier { notional_cap: 50_000.0, mmr: 0.004, maint_amount: 0.0 },
        MmrTier { notional_cap: 250_000.0, mmr: 0.005, maint_amount: 50.0 },
        MmrTier { notional_cap: 1_000_000.0, mmr: 0.01, maint_amount: 1_300.0 },
        MmrTier { notional_cap: f64::MAX, mmr: 0.025, maint_amount: 16_300.0 },
    ]
}

fn default_max_bars() -> usize {
    1_000
}

fn default_warmup_extra_bars() -> usize {
    50
}

fn default_warmup_buffer_mult() -> usize {
    3
}

fn default_funding_rate() -> f64 {
    0.0001
}

fn default_funding_interval_hours() -> u32 {
    8
}

fn default_dedup_ttl_ms() -> u64 {
    300_000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3001
}

fn default_base_path() -> String {
    "/api/v1".to_string()
}

fn default_ws_push_interval() -> String {
    "raw".to_string()
}

fn default_db_path() -> String {
    "vela.db".to_string()
}

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_strategy_id() -> String {
    "trend-pullback-a".to_string()
}

fn default_strategy_type() -> String {
    "trend_pullback".to_string()
}

fn default_htf_interval() -> String {
    "1h".to_string()
}

fn default_exec_interval() -> String {
    "15m".to_string()
}

fn default_strategies() -> Vec<StrategyInstanceConfig> {
    vec![StrategyInstanceConfig {
        id: default_strategy_id(),
        strategy_type: default_strategy_type(),
        params: StrategyParams::default(),
    }]
}

// =============================================================================
// Sub-structs
// =============================================================================

/// Indicator window sizes shared by every strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "default_rsi_length")]
    pub rsi_length: usize,
    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
    #[serde(default = "default_atr_length")]
    pub atr_length: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_fast: default_ema_fast(),
            ema_slow: default_ema_slow(),
            rsi_length: default_rsi_length(),
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
            atr_length: default_atr_length(),
        }
    }
}

impl IndicatorConfig {
    /// Number of closed bars the slowest indicator needs before it produces
    /// its first value.  Buffer and warmup sizing derive from this.
    pub fn longest_warmup(&self) -> usize {
        let macd_warmup = self.macd_slow + self.macd_signal;
        self.ema_slow
            .max(self.rsi_length + 1)
            .max(macd_warmup)
            .max(self.atr_length + 1)
    }
}

/// One tier of the maintenance-margin schedule used for liquidation pricing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MmrTier {
    /// Upper notional bound of this tier (inclusive).
    pub notional_cap: f64,
    /// Maintenance margin rate within the tier.
    pub mmr: f64,
    /// Maintenance amount deduction for the tier.
    pub maint_amount: f64,
}

/// Tunable parameters of a single strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Minimum normalised EMA separation for the higher-timeframe trend gate.
    #[serde(default = "default_trend_strength_min")]
    pub trend_strength_min: f64,

    /// ATR multiplier for the volatility stop.
    #[serde(default = "default_atr_stop_mult")]
    pub atr_stop_mult: f64,

    /// Execution-interval bars to wait after a stop-out before re-entering.
    #[serde(default = "default_cooldown_after_stop")]
    pub cooldown_after_stop: u32,

    #[serde(default = "default_rsi_long_lo")]
    pub rsi_long_lo: f64,
    #[serde(default = "default_rsi_long_hi")]
    pub rsi_long_hi: f64,
    #[serde(default = "default_rsi_short_lo")]
    pub rsi_short_lo: f64,
    #[serde(default = "default_rsi_short_hi")]
    pub rsi_short_hi: f64,

    /// When true, the RSI slope must confirm the entry direction.
    #[serde(default = "default_true")]
    pub rsi_slope_required: bool,

    /// Closed execution-interval bars scanned for the structural swing stop.
    #[serde(default = "default_swing_lookback")]
    pub swing_lookback: usize,

    /// Higher timeframe used for the direction filter.
    #[serde(default = "default_htf_interval")]
    pub htf_interval: String,

    /// Timeframe entries and exits are evaluated on.
    #[serde(default = "default_exec_interval")]
    pub exec_interval: String,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            trend_strength_min: default_trend_strength_min(),
            atr_stop_mult: default_atr_stop_mult(),
            cooldown_after_stop: default_cooldown_after_stop(),
            rsi_long_lo: default_rsi_long_lo(),
            rsi_long_hi: default_rsi_long_hi(),
            rsi_short_lo: default_rsi_short_lo(),
            rsi_short_hi: default_rsi_short_hi(),
            rsi_slope_required: true,
            swing_lookback: default_swing_lookback(),
            htf_interval: default_htf_interval(),
            exec_interval: default_exec_interval(),
        }
    }
}

/// A configured strategy instance: id + type tag + its parameter block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInstanceConfig {
    pub id: String,
    #[serde(default = "default_strategy_type", rename = "type")]
    pub strategy_type: String,
    #[serde(default)]
    pub params: StrategyParams,
}

/// Cache sizing for the kline buffer and REST warmup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_max_bars")]
    pub max_bars: usize,
    #[serde(default = "default_warmup_extra_bars")]
    pub warmup_extra_bars: usize,
    #[serde(default = "default_warmup_buffer_mult")]
    pub warmup_buffer_mult: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_bars: default_max_bars(),
            warmup_extra_bars: default_warmup_extra_bars(),
            warmup_buffer_mult: default_warmup_buffer_mult(),
        }
    }
}

/// Optional funding simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_funding_rate")]
    pub rate: f64,
    #[serde(default = "default_funding_interval_hours")]
    pub interval_hours: u32,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: default_funding_rate(),
            interval_hours: default_funding_interval_hours(),
        }
    }
}

/// Alert transport settings.  Delivery is best-effort and never blocks the
/// core loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            dedup_ttl_ms: default_dedup_ttl_ms(),
        }
    }
}

/// HTTP/WebSocket API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// "raw" pushes on every update; an integer second count coalesces to
    /// that cadence.
    #[serde(default = "default_ws_push_interval")]
    pub ws_push_interval: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            base_path: default_base_path(),
            ws_push_interval: default_ws_push_interval(),
        }
    }
}

/// SQLite location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Upstream exchange endpoints.  Only the URL bases are configurable; the
/// wire shapes are Binance futures klines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Vela engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Market subscription -------------------------------------------------
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Intervals subscribed on the combined stream.  Must contain every
    /// interval referenced by a strategy instance.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<String>,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    // --- Simulated account ---------------------------------------------------
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,

    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,

    /// Taker fee rate applied to every simulated fill.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    // --- Indicators ----------------------------------------------------------
    #[serde(default)]
    pub indicators: IndicatorConfig,

    // --- Risk / liquidation --------------------------------------------------
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: f64,

    #[serde(default = "default_max_position_pct_equity")]
    pub max_position_pct_equity: f64,

    #[serde(default = "default_mmr_tiers")]
    pub mmr_tiers: Vec<MmrTier>,

    // --- Cache sizing --------------------------------------------------------
    #[serde(default)]
    pub buffer: BufferConfig,

    // --- Funding -------------------------------------------------------------
    #[serde(default)]
    pub funding: FundingConfig,

    // --- Alerts --------------------------------------------------------------
    #[serde(default)]
    pub alerts: AlertConfig,

    // --- API -----------------------------------------------------------------
    #[serde(default)]
    pub api: ApiConfig,

    // --- Storage -------------------------------------------------------------
    #[serde(default)]
    pub db: DbConfig,

    // --- Strategy instances --------------------------------------------------
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyInstanceConfig>,

    #[serde(default = "default_strategy_id")]
    pub default_strategy: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            intervals: default_intervals(),
            exchange: ExchangeConfig::default(),
            initial_capital: default_initial_capital(),
            max_leverage: default_max_leverage(),
            fee_rate: default_fee_rate(),
            indicators: IndicatorConfig::default(),
            max_position_notional: default_max_position_notional(),
            max_position_pct_equity: default_max_position_pct_equity(),
            mmr_tiers: default_mmr_tiers(),
            buffer: BufferConfig::default(),
            funding: FundingConfig::default(),
            alerts: AlertConfig::default(),
            api: ApiConfig::default(),
            db: DbConfig::default(),
            strategies: default_strategies(),
            default_strategy: default_strategy_id(),
        }
    }
}

impl RuntimeConfig {
    /// Closed bars required in the buffer per interval: the slowest warmup
    /// scaled by the buffer multiplier, floored by the configured maximum.
    pub fn buffer_capacity(&self) -> usize {
        (self.indicators.longest_warmup() * self.buffer.warmup_buffer_mult)
            .max(self.buffer.max_bars)
    }

    /// Bars fetched during REST warmup per interval.
    pub fn warmup_bars(&self) -> usize {
        self.indicators.longest_warmup() * self.buffer.warmup_buffer_mult
            + self.buffer.warmup_extra_bars
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            intervals = ?config.intervals,
            strategies = config.strategies.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.intervals, vec!["15m", "1h"]);
        assert!((cfg.fee_rate - 0.0004).abs() < f64::EPSILON);
        assert_eq!(cfg.strategies.len(), 1);
        assert_eq!(cfg.strategies[0].id, cfg.default_strategy);
        assert_eq!(cfg.strategies[0].strategy_type, "trend_pullback");
        assert!(!cfg.funding.enabled);
        assert_eq!(cfg.mmr_tiers.len(), 4);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.api.port, 3001);
        assert_eq!(cfg.api.base_path, "/api/v1");
        assert_eq!(cfg.api.ws_push_interval, "raw");
        assert_eq!(cfg.db.path, "vela.db");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "symbol": "ETHUSDT",
            "strategies": [
                { "id": "aggressive", "type": "trend_pullback",
                  "params": { "atr_stop_mult": 2.5 } }
            ],
            "default_strategy": "aggressive"
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.strategies[0].id, "aggressive");
        assert!((cfg.strategies[0].params.atr_stop_mult - 2.5).abs() < f64::EPSILON);
        // Untouched params keep their defaults.
        assert!(cfg.strategies[0].params.rsi_slope_required);
        assert_eq!(cfg.strategies[0].params.exec_interval, "15m");
    }

    #[test]
    fn longest_warmup_picks_slowest_indicator() {
        let ind = IndicatorConfig::default();
        // ema_slow(50) > macd_slow(26) + macd_signal(9) = 35.
        assert_eq!(ind.longest_warmup(), 50);

        let ind = IndicatorConfig { ema_slow: 20, ..IndicatorConfig::default() };
        assert_eq!(ind.longest_warmup(), 35);
    }

    #[test]
    fn buffer_capacity_respects_floor() {
        let cfg = RuntimeConfig::default();
        // 50 * 3 = 150 < max_bars 1000 -> floor wins.
        assert_eq!(cfg.buffer_capacity(), 1_000);
        assert_eq!(cfg.warmup_bars(), 50 * 3 + 50);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.intervals, cfg2.intervals);
        assert_eq!(cfg.strategies.len(), cfg2.strategies.len());
    }
}
