use std::sync::{Arc, Mutex};

use anyhow::Context;

use predex::accounts::UserDirectory;
use predex::bus::EventBus;
use predex::clock::{Clock, SystemClock};
use predex::config::AppConfig;
use predex::engine::IdGen;
use predex::gateway::{self, state::AppState};
use predex::logging::init_logging;
use predex::store::{self, MemoryStore, Persistence};
use predex::worker::{EngineDeps, MarketRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("PDX_ENV").unwrap_or_else(|_| "dev".to_string());
    let config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&config);
    tracing::info!(env = %env, "predex starting");

    let store: Arc<dyn Persistence> = Arc::new(MemoryStore::new());

    // Rebuild in-memory state: balances/positions verbatim, orderbooks
    // from persisted OPEN/PARTIAL orders
    let recovered = store::recover(store.as_ref())
        .map_err(|e| anyhow::anyhow!(e))
        .context("recovery failed")?;

    let users = Arc::new(UserDirectory::new(recovered.next_user_id));
    for record in store.load_users().map_err(|e| anyhow::anyhow!(e))? {
        users.restore(record);
    }

    let ledger = Arc::new(Mutex::new(recovered.ledger));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = EventBus::new(config.engine.event_queue_size);
    let ids = IdGen::new(recovered.next_order_id, recovered.next_trade_id);

    let registry = MarketRegistry::new(
        EngineDeps {
            ledger: Arc::clone(&ledger),
            store: Arc::clone(&store),
            clock: Arc::clone(&clock),
            bus: Arc::clone(&bus),
            ids,
        },
        recovered.next_market_id,
        config.engine.command_queue_size,
        config.engine.snapshot_depth,
    );

    let mut books = recovered.books;
    let mut adopted = 0;
    for market in recovered.markets {
        if market.is_active() {
            let book = books.remove(&market.id).unwrap_or_default();
            registry.adopt(market, book);
            adopted += 1;
        }
    }
    tracing::info!(markets = adopted, "active markets recovered");

    // Event dispatch runs off the engine's critical path
    tokio::spawn(Arc::clone(&bus).run_dispatch());

    let state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        registry,
        users,
        ledger,
        store,
        bus,
        clock,
    });

    gateway::run_server(&config, state).await
}
