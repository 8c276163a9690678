//! Persistence capability
//!
//! The engine consumes this interface; it never owns a database handle.
//! The shipped implementation is in-memory. Recovery rebuilds the
//! orderbooks from persisted OPEN/PARTIAL orders; balances and positions
//! are durable as written, and trades are append-only and never replayed.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::accounts::UserRecord;
use crate::balance::Balance;
use crate::core_types::{MarketId, OrderId, UserId};
use crate::ledger::Ledger;
use crate::models::{Market, MarketScope, Order, OrderStatus};
use crate::models::Trade;
use crate::orderbook::MarketBook;
use crate::position::Position;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

/// Load/save surface the trading core depends on.
pub trait Persistence: Send + Sync {
    fn save_user(&self, user: &UserRecord) -> Result<(), StoreError>;
    fn load_users(&self) -> Result<Vec<UserRecord>, StoreError>;

    fn save_market(&self, market: &Market) -> Result<(), StoreError>;
    fn load_markets(&self) -> Result<Vec<Market>, StoreError>;

    fn save_order(&self, order: &Order) -> Result<(), StoreError>;
    fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;
    fn load_orders(&self) -> Result<Vec<Order>, StoreError>;
    fn orders_for_user(
        &self,
        user: UserId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, StoreError>;

    fn append_trade(&self, trade: &Trade) -> Result<(), StoreError>;
    fn load_trades(&self) -> Result<Vec<Trade>, StoreError>;
    fn trades_for_market(&self, market: MarketId, limit: usize) -> Result<Vec<Trade>, StoreError>;

    fn save_balance(
        &self,
        user: UserId,
        scope: MarketScope,
        balance: Balance,
    ) -> Result<(), StoreError>;
    fn load_balances(&self) -> Result<Vec<(UserId, MarketScope, Balance)>, StoreError>;

    fn save_position(
        &self,
        user: UserId,
        market: MarketId,
        position: &Position,
    ) -> Result<(), StoreError>;
    fn load_positions(&self) -> Result<Vec<(UserId, MarketId, Position)>, StoreError>;
}

/// In-memory persistence. Concurrent maps per entity; the trade log is
/// a plain append-only vector.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<UserId, UserRecord>,
    markets: DashMap<MarketId, Market>,
    orders: DashMap<OrderId, Order>,
    trades: Mutex<Vec<Trade>>,
    balances: DashMap<(UserId, MarketScope), Balance>,
    positions: DashMap<(UserId, MarketId), Position>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryStore {
    fn save_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    fn load_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.users.iter().map(|e| e.value().clone()).collect())
    }

    fn save_market(&self, market: &Market) -> Result<(), StoreError> {
        self.markets.insert(market.id, market.clone());
        Ok(())
    }

    fn load_markets(&self) -> Result<Vec<Market>, StoreError> {
        let mut out: Vec<_> = self.markets.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|m| m.id);
        Ok(out)
    }

    fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        self.orders.insert(order.id, order.clone());
        Ok(())
    }

    fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&id).map(|e| e.value().clone()))
    }

    fn load_orders(&self) -> Result<Vec<Order>, StoreError> {
        let mut out: Vec<_> = self.orders.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|o| (o.created_at_ms, o.id));
        Ok(out)
    }

    fn orders_for_user(
        &self,
        user: UserId,
        status: Option<OrderStatus>,
    ) -> Result<Vec<Order>, StoreError> {
        let mut out: Vec<_> = self
            .orders
            .iter()
            .filter(|e| e.value().user_id == user)
            .filter(|e| status.map_or(true, |s| e.value().status == s))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|o| std::cmp::Reverse((o.created_at_ms, o.id)));
        Ok(out)
    }

    fn append_trade(&self, trade: &Trade) -> Result<(), StoreError> {
        self.trades
            .lock()
            .map_err(|_| StoreError::Unavailable("trade log poisoned".into()))?
            .push(trade.clone());
        Ok(())
    }

    fn load_trades(&self) -> Result<Vec<Trade>, StoreError> {
        Ok(self
            .trades
            .lock()
            .map_err(|_| StoreError::Unavailable("trade log poisoned".into()))?
            .clone())
    }

    fn trades_for_market(&self, market: MarketId, limit: usize) -> Result<Vec<Trade>, StoreError> {
        let log = self
            .trades
            .lock()
            .map_err(|_| StoreError::Unavailable("trade log poisoned".into()))?;
        Ok(log
            .iter()
            .rev()
            .filter(|t| t.market_id == market)
            .take(limit)
            .cloned()
            .collect())
    }

    fn save_balance(
        &self,
        user: UserId,
        scope: MarketScope,
        balance: Balance,
    ) -> Result<(), StoreError> {
        self.balances.insert((user, scope), balance);
        Ok(())
    }

    fn load_balances(&self) -> Result<Vec<(UserId, MarketScope, Balance)>, StoreError> {
        Ok(self
            .balances
            .iter()
            .map(|e| {
                let ((user, scope), bal) = (*e.key(), *e.value());
                (user, scope, bal)
            })
            .collect())
    }

    fn save_position(
        &self,
        user: UserId,
        market: MarketId,
        position: &Position,
    ) -> Result<(), StoreError> {
        self.positions.insert((user, market), *position);
        Ok(())
    }

    fn load_positions(&self) -> Result<Vec<(UserId, MarketId, Position)>, StoreError> {
        Ok(self
            .positions
            .iter()
            .map(|e| {
                let ((user, market), pos) = (*e.key(), *e.value());
                (user, market, pos)
            })
            .collect())
    }
}

/// Everything rebuilt from persistence at startup.
pub struct RecoveredState {
    pub ledger: Ledger,
    pub markets: Vec<Market>,
    pub books: HashMap<MarketId, MarketBook>,
    pub next_user_id: UserId,
    pub next_market_id: MarketId,
    pub next_order_id: OrderId,
    pub next_trade_id: u64,
}

/// Rebuild in-memory state after a restart.
///
/// Orderbooks are reconstructed by resting OPEN/PARTIAL orders of active
/// markets back in created-at order, which restores price-time priority
/// without re-matching.
pub fn recover(store: &dyn Persistence) -> Result<RecoveredState, StoreError> {
    let mut ledger = Ledger::new();
    for (user, scope, balance) in store.load_balances()? {
        ledger.restore_balance(user, scope, balance);
    }
    for (user, market, position) in store.load_positions()? {
        ledger.restore_position(user, market, position);
    }

    let markets = store.load_markets()?;
    let mut books: HashMap<MarketId, MarketBook> = markets
        .iter()
        .filter(|m| m.is_active())
        .map(|m| (m.id, MarketBook::new()))
        .collect();

    let mut next_order_id = 1;
    for order in store.load_orders()? {
        next_order_id = next_order_id.max(order.id + 1);
        if matches!(order.status, OrderStatus::Open | OrderStatus::Partial) {
            if let Some(book) = books.get_mut(&order.market_id) {
                book.side_mut(order.side).rest(order);
            }
        }
    }

    let next_user_id = store
        .load_users()?
        .iter()
        .map(|u| u.id + 1)
        .max()
        .unwrap_or(1);
    let next_market_id = markets.iter().map(|m| m.id + 1).max().unwrap_or(1);
    let next_trade_id = store
        .load_trades()?
        .iter()
        .map(|t| t.id + 1)
        .max()
        .unwrap_or(1);

    Ok(RecoveredState {
        ledger,
        markets,
        books,
        next_user_id,
        next_market_id,
        next_order_id,
        next_trade_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderKind, Side};

    fn order(id: OrderId, market: MarketId, status: OrderStatus, at: u64) -> Order {
        let mut o = Order::new(id, market, 1, Side::Yes, OrderKind::Buy, 60, 10, at);
        o.status = status;
        if status == OrderStatus::Filled {
            o.filled = o.quantity;
        }
        o
    }

    #[test]
    fn recovery_rests_only_open_orders() {
        let store = MemoryStore::new();
        let market = Market::new(5, "t".into(), "d".into(), 1, MarketScope::Global, 0, 0);
        store.save_market(&market).unwrap();
        store.save_order(&order(1, 5, OrderStatus::Open, 10)).unwrap();
        store.save_order(&order(2, 5, OrderStatus::Filled, 11)).unwrap();
        store.save_order(&order(3, 5, OrderStatus::Cancelled, 12)).unwrap();

        let state = recover(&store).unwrap();
        let book = state.books.get(&5).unwrap();
        assert_eq!(book.iter().count(), 1);
        assert_eq!(book.iter().next().unwrap().id, 1);
        assert_eq!(state.next_order_id, 4);
    }

    #[test]
    fn recovery_restores_ledger_rows() {
        let store = MemoryStore::new();
        let mut bal = Balance::default();
        bal.deposit(1_000).unwrap();
        store.save_balance(9, MarketScope::Global, bal).unwrap();

        let mut pos = Position::default();
        pos.acquire(Side::No, 4, 160).unwrap();
        store.save_position(9, 2, &pos).unwrap();

        let state = recover(&store).unwrap();
        assert_eq!(state.ledger.balance(9, MarketScope::Global).avail(), 1_000);
        assert_eq!(state.ledger.position(9, 2).no.shares, 4);
    }

    #[test]
    fn orders_for_user_filters_by_status() {
        let store = MemoryStore::new();
        store.save_order(&order(1, 5, OrderStatus::Open, 10)).unwrap();
        store.save_order(&order(2, 5, OrderStatus::Filled, 11)).unwrap();

        let open = store.orders_for_user(1, Some(OrderStatus::Open)).unwrap();
        assert_eq!(open.len(), 1);
        let all = store.orders_for_user(1, None).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].id, 2);
    }
}
