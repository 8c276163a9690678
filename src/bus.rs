//! EventBus - typed pub/sub keyed by market id
//!
//! The engine publishes after commit by pushing onto a lock-free ring
//! buffer; a dedicated dispatch worker drains the queue and fans events
//! out to subscribers, so a slow consumer never blocks the matching
//! critical path. Delivery is best-effort and ordered per
//! (market, subscriber); a full ring drops the event with a warning.
//!
//! Subscribers register an unbounded sender per market (orderbook and
//! trade events) or per user (portfolio deltas). A failed send marks the
//! subscriber disconnected and removes it lazily.

use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core_types::{Cents, MarketId, UserId};
use crate::models::{Outcome, Trade};
use crate::orderbook::BookSnapshot;

/// Market-keyed events pushed to every subscriber of that market.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    OrderbookUpdate {
        market_id: MarketId,
        #[serde(flatten)]
        snapshot: BookSnapshot,
    },
    TradeExecuted {
        market_id: MarketId,
        trade: Trade,
        /// Sentinel for share-minting trades.
        minted: bool,
    },
    MarketResolved {
        market_id: MarketId,
        outcome: Outcome,
    },
    MarketDeleted {
        market_id: MarketId,
    },
}

impl MarketEvent {
    pub fn market_id(&self) -> MarketId {
        match self {
            MarketEvent::OrderbookUpdate { market_id, .. }
            | MarketEvent::TradeExecuted { market_id, .. }
            | MarketEvent::MarketResolved { market_id, .. }
            | MarketEvent::MarketDeleted { market_id } => *market_id,
        }
    }
}

/// Targeted notification that a user's balance or position changed.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioDelta {
    pub user_id: UserId,
    pub market_id: MarketId,
    pub balance_avail: Cents,
    pub balance_frozen: Cents,
    pub yes_shares: u64,
    pub no_shares: u64,
}

/// Everything the engine emits, before routing.
#[derive(Debug, Clone)]
pub enum PushEvent {
    Market(MarketEvent),
    Portfolio(PortfolioDelta),
}

pub type SubId = u64;
pub type MarketEventRx = mpsc::UnboundedReceiver<MarketEvent>;
pub type PortfolioRx = mpsc::UnboundedReceiver<PortfolioDelta>;

pub struct EventBus {
    queue: ArrayQueue<PushEvent>,
    market_subs: DashMap<MarketId, Vec<(SubId, mpsc::UnboundedSender<MarketEvent>)>>,
    user_subs: DashMap<UserId, Vec<(SubId, mpsc::UnboundedSender<PortfolioDelta>)>>,
    next_sub_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(capacity),
            market_subs: DashMap::new(),
            user_subs: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
        })
    }

    /// Enqueue an event for dispatch. Never blocks; drops on overflow.
    pub fn publish(&self, event: PushEvent) {
        if self.queue.push(event).is_err() {
            tracing::warn!("event queue full, dropping push event");
        }
    }

    pub fn subscribe_market(
        &self,
        market_id: MarketId,
    ) -> (SubId, MarketEventRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.market_subs
            .entry(market_id)
            .or_default()
            .push((sub_id, tx));
        tracing::debug!(market_id, sub_id, "market subscription added");
        (sub_id, rx)
    }

    pub fn unsubscribe_market(&self, market_id: MarketId, sub_id: SubId) {
        if let Some(mut subs) = self.market_subs.get_mut(&market_id) {
            subs.retain(|(id, _)| *id != sub_id);
        }
    }

    pub fn subscribe_user(&self, user_id: UserId) -> (SubId, PortfolioRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.user_subs.entry(user_id).or_default().push((sub_id, tx));
        (sub_id, rx)
    }

    pub fn unsubscribe_user(&self, user_id: UserId, sub_id: SubId) {
        if let Some(mut subs) = self.user_subs.get_mut(&user_id) {
            subs.retain(|(id, _)| *id != sub_id);
        }
    }

    /// Pop one pending event without dispatching (test hook).
    pub fn try_pop(&self) -> Option<PushEvent> {
        self.queue.pop()
    }

    /// Dispatch worker. Runs in its own tokio task so the engine's
    /// critical path never waits on consumers.
    pub async fn run_dispatch(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_millis(1));
        tracing::info!("event bus dispatcher started");
        loop {
            tick.tick().await;
            let mut drained = 0;
            while let Some(event) = self.queue.pop() {
                self.dispatch(event);
                drained += 1;
                if drained >= 1024 {
                    break;
                }
            }
        }
    }

    fn dispatch(&self, event: PushEvent) {
        match event {
            PushEvent::Market(event) => {
                let market_id = event.market_id();
                if let Some(mut subs) = self.market_subs.get_mut(&market_id) {
                    // Publication to a disconnected subscriber removes it
                    subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
                }
            }
            PushEvent::Portfolio(delta) => {
                if let Some(mut subs) = self.user_subs.get_mut(&delta.user_id) {
                    subs.retain(|(_, tx)| tx.send(delta.clone()).is_ok());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_event(market_id: MarketId) -> PushEvent {
        PushEvent::Market(MarketEvent::MarketResolved {
            market_id,
            outcome: Outcome::Yes,
        })
    }

    #[test]
    fn dispatch_routes_by_market() {
        let bus = EventBus::new(16);
        let (_, mut rx_a) = bus.subscribe_market(1);
        let (_, mut rx_b) = bus.subscribe_market(2);

        bus.publish(resolved_event(1));
        let event = bus.try_pop().unwrap();
        bus.dispatch(event);

        assert!(matches!(
            rx_a.try_recv(),
            Ok(MarketEvent::MarketResolved { market_id: 1, .. })
        ));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(16);
        let (sub_id, mut rx) = bus.subscribe_market(1);
        bus.unsubscribe_market(1, sub_id);

        bus.publish(resolved_event(1));
        let event = bus.try_pop().unwrap();
        bus.dispatch(event);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let bus = EventBus::new(16);
        let (_, rx) = bus.subscribe_market(7);
        drop(rx);

        bus.publish(resolved_event(7));
        let event = bus.try_pop().unwrap();
        bus.dispatch(event);
        assert!(bus.market_subs.get(&7).unwrap().is_empty());
    }

    #[test]
    fn portfolio_events_target_one_user() {
        let bus = EventBus::new(16);
        let (_, mut rx_1) = bus.subscribe_user(1);
        let (_, mut rx_2) = bus.subscribe_user(2);

        bus.publish(PushEvent::Portfolio(PortfolioDelta {
            user_id: 1,
            market_id: 4,
            balance_avail: 400,
            balance_frozen: 0,
            yes_shares: 10,
            no_shares: 0,
        }));
        let event = bus.try_pop().unwrap();
        bus.dispatch(event);

        assert_eq!(rx_1.try_recv().unwrap().balance_avail, 400);
        assert!(rx_2.try_recv().is_err());
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let bus = EventBus::new(1);
        bus.publish(resolved_event(1));
        bus.publish(resolved_event(2)); // dropped, no panic
        assert!(bus.try_pop().is_some());
        assert!(bus.try_pop().is_none());
    }
}
