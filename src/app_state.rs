// =============================================================================
// Central Application State — Vela Paper Engine
// =============================================================================
//
// Ties the passive subsystems together for the API layer.  Mutable state is
// owned elsewhere (each strategy task owns its account, the source owns the
// connection, the DAO writer owns storage); AppState only holds the handles
// and the published read-only views.
// =============================================================================

use std::sync::Arc;

use crate::fanout::FanoutHub;
use crate::market_data::source::MarketSource;
use crate::market_data::KlineBuffer;
use crate::runtime_config::RuntimeConfig;
use crate::store::DaoHandle;
use crate::strategy::StrategyShared;

/// Shared across all API tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub buffer: Arc<KlineBuffer>,
    pub dao: DaoHandle,
    pub fanout: Arc<FanoutHub>,
    pub source: Arc<MarketSource>,
    /// Published views, one per configured strategy instance.
    pub strategies: Vec<Arc<StrategyShared>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn strategy(&self, id: &str) -> Option<&Arc<StrategyShared>> {
        self.strategies.iter().find(|s| s.id == id)
    }

    /// The strategy a request addresses: the `strategy` query parameter, or
    /// the configured default.
    pub fn strategy_or_default(&self, id: Option<&str>) -> Option<&Arc<StrategyShared>> {
        match id {
            Some(id) => self.strategy(id),
            None => self.strategy(&self.config.default_strategy),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
