//! Per-market serial actors
//!
//! Exactly one worker task owns each market's engine and orderbook; all
//! commands for that market are linearised through a bounded channel, so
//! no locking exists inside the matching critical section. Snapshot
//! reads go through the same channel and are answered by the same
//! worker. Across markets, workers run in parallel.
//!
//! Deadlines are enforced at the enqueue edge: if the channel cannot
//! accept the command before the deadline the caller gets `TIMEOUT` and
//! nothing was enqueued. Once accepted, a command always runs to
//! completion.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::core_types::MarketId;
use crate::engine::{IdGen, MarketEngine};
use crate::ledger::Ledger;
use crate::messages::{Command, EngineError, Report};
use crate::models::{Market, MarketScope};
use crate::orderbook::{BookSnapshot, MarketBook};
use crate::store::Persistence;

/// Messages accepted by a market worker.
enum WorkerMsg {
    Execute {
        cmd: Command,
        reply: oneshot::Sender<Result<Report, EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<(Market, BookSnapshot)>,
    },
}

/// Client handle to one market's worker.
#[derive(Clone)]
pub struct MarketHandle {
    tx: mpsc::Sender<WorkerMsg>,
}

impl MarketHandle {
    /// Enqueue a command and await its report. `deadline` bounds only
    /// the enqueue; execution is run-to-completion.
    pub async fn execute(&self, cmd: Command, deadline: Duration) -> Result<Report, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let msg = WorkerMsg::Execute {
            cmd,
            reply: reply_tx,
        };
        self.tx
            .send_timeout(msg, deadline)
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => EngineError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => EngineError::ServiceUnavailable,
            })?;
        reply_rx.await.map_err(|_| EngineError::ServiceUnavailable)?
    }

    /// Orderbook snapshot plus current market record, served by the
    /// owning worker so the book needs no lock.
    pub async fn snapshot(&self, deadline: Duration) -> Result<(Market, BookSnapshot), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send_timeout(WorkerMsg::Snapshot { reply: reply_tx }, deadline)
            .await
            .map_err(|err| match err {
                mpsc::error::SendTimeoutError::Timeout(_) => EngineError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => EngineError::ServiceUnavailable,
            })?;
        reply_rx.await.map_err(|_| EngineError::ServiceUnavailable)
    }
}

/// Worker loop: one command at a time until the channel closes or a
/// fatal error halts the market.
async fn run_worker(mut engine: MarketEngine, mut rx: mpsc::Receiver<WorkerMsg>) {
    let market_id = engine.market().id;
    tracing::info!(market_id, "market worker started");
    while let Some(msg) = rx.recv().await {
        match msg {
            WorkerMsg::Execute { cmd, reply } => {
                let result = engine.handle(cmd);
                let fatal = matches!(result, Err(EngineError::Fatal(_)));
                if fatal {
                    tracing::error!(market_id, error = ?result, "fatal engine error, halting market worker");
                }
                let _ = reply.send(result);
                if fatal {
                    // Admin intervention required; further sends see a
                    // closed channel and map to SERVICE_UNAVAILABLE.
                    return;
                }
            }
            WorkerMsg::Snapshot { reply } => {
                let _ = reply.send((engine.market().clone(), engine.snapshot()));
            }
        }
    }
    tracing::info!(market_id, "market worker stopped");
}

/// Shared dependencies handed to every spawned market engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub ledger: Arc<Mutex<Ledger>>,
    pub store: Arc<dyn Persistence>,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<EventBus>,
    pub ids: Arc<IdGen>,
}

/// Registry of live markets and their worker handles.
pub struct MarketRegistry {
    deps: EngineDeps,
    markets: DashMap<MarketId, MarketHandle>,
    next_market_id: std::sync::atomic::AtomicU64,
    command_queue_size: usize,
    snapshot_depth: usize,
}

impl MarketRegistry {
    pub fn new(
        deps: EngineDeps,
        next_market_id: MarketId,
        command_queue_size: usize,
        snapshot_depth: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps,
            markets: DashMap::new(),
            next_market_id: std::sync::atomic::AtomicU64::new(next_market_id),
            command_queue_size,
            snapshot_depth,
        })
    }

    /// Spawn a worker for a recovered market with its rebuilt book.
    pub fn adopt(&self, market: Market, book: MarketBook) {
        let id = market.id;
        let handle = self.spawn(market, book);
        self.markets.insert(id, handle);
    }

    /// Create a brand new market and its worker.
    pub fn create_market(
        &self,
        title: String,
        description: String,
        created_by: u64,
        scope: MarketScope,
        resolve_at_ms: u64,
    ) -> Result<Market, EngineError> {
        let id = self
            .next_market_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let market = Market::new(
            id,
            title,
            description,
            created_by,
            scope,
            self.deps.clock.now_ms(),
            resolve_at_ms,
        );
        self.deps
            .store
            .save_market(&market)
            .map_err(|_| EngineError::ServiceUnavailable)?;
        let handle = self.spawn(market.clone(), MarketBook::new());
        self.markets.insert(id, handle);
        tracing::info!(market_id = id, title = %market.title, "market created");
        Ok(market)
    }

    pub fn handle(&self, market_id: MarketId) -> Result<MarketHandle, EngineError> {
        self.markets
            .get(&market_id)
            .map(|h| h.clone())
            .ok_or(EngineError::NotFound)
    }

    fn spawn(&self, market: Market, book: MarketBook) -> MarketHandle {
        let (tx, rx) = mpsc::channel(self.command_queue_size);
        let engine = MarketEngine::new(
            market,
            book,
            Arc::clone(&self.deps.ledger),
            Arc::clone(&self.deps.store),
            Arc::clone(&self.deps.clock),
            Arc::clone(&self.deps.bus),
            Arc::clone(&self.deps.ids),
            self.snapshot_depth,
        );
        tokio::spawn(run_worker(engine, rx));
        MarketHandle { tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{OrderKind, Side};
    use crate::store::MemoryStore;

    fn registry() -> (Arc<MarketRegistry>, Arc<Mutex<Ledger>>) {
        let mut ledger = Ledger::new();
        ledger.deposit(1, MarketScope::Global, 100_000).unwrap();
        ledger.deposit(2, MarketScope::Global, 100_000).unwrap();
        let ledger = Arc::new(Mutex::new(ledger));
        let deps = EngineDeps {
            ledger: Arc::clone(&ledger),
            store: Arc::new(MemoryStore::new()),
            clock: ManualClock::new(0),
            bus: EventBus::new(256),
            ids: IdGen::new(1, 1),
        };
        (MarketRegistry::new(deps, 1, 64, 10), ledger)
    }

    #[tokio::test]
    async fn commands_round_trip_through_worker() {
        let (registry, ledger) = registry();
        let market = registry
            .create_market("t".into(), "d".into(), 1, MarketScope::Global, 0)
            .unwrap();
        let handle = registry.handle(market.id).unwrap();

        let report = handle
            .execute(
                Command::PlaceLimit {
                    user: 1,
                    side: Side::Yes,
                    kind: OrderKind::Buy,
                    price: 60,
                    quantity: 10,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(report.order.is_some());
        assert_eq!(
            ledger
                .lock()
                .unwrap()
                .balance(1, MarketScope::Global)
                .frozen(),
            600
        );

        let (snap_market, snapshot) = handle.snapshot(Duration::from_secs(1)).await.unwrap();
        assert_eq!(snap_market.id, market.id);
        assert_eq!(snapshot.yes.bids.len(), 1);
    }

    #[tokio::test]
    async fn unknown_market_is_not_found() {
        let (registry, _) = registry();
        assert!(matches!(registry.handle(42), Err(EngineError::NotFound)));
    }
}
