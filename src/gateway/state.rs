use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::accounts::UserDirectory;
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::core_types::MarketId;
use crate::ledger::Ledger;
use crate::messages::EngineError;
use crate::store::Persistence;
use crate::worker::{MarketHandle, MarketRegistry};

/// Shared gateway state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<MarketRegistry>,
    pub users: Arc<UserDirectory>,
    pub ledger: Arc<Mutex<Ledger>>,
    pub store: Arc<dyn Persistence>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Enqueue deadline for engine commands.
    pub fn command_deadline(&self) -> Duration {
        Duration::from_millis(self.config.engine.command_deadline_ms)
    }

    /// Resolve a market's worker handle. Terminal markets have no worker
    /// after a restart; they answer MARKET_CLOSED rather than NOT_FOUND.
    pub fn market_handle(&self, market_id: MarketId) -> Result<MarketHandle, EngineError> {
        match self.registry.handle(market_id) {
            Ok(handle) => Ok(handle),
            Err(err) => match self.store.load_markets() {
                Ok(markets) => match markets.iter().find(|m| m.id == market_id) {
                    Some(market) if !market.is_active() => Err(EngineError::MarketClosed),
                    Some(_) => Err(EngineError::ServiceUnavailable),
                    None => Err(EngineError::NotFound),
                },
                Err(_) => Err(err),
            },
        }
    }
}
