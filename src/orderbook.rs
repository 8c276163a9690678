//! Orderbook - BTreeMap-based price-time priority books
//!
//! A [`SideBook`] holds the resting limit orders for one outcome side of
//! one market. Matching logic lives in the engine; the book only stores,
//! fills front orders, cancels and snapshots.
//!
//! # Key design
//! - Asks are keyed by price (ascending, lowest = best).
//! - Bids are keyed by `u64::MAX - price` so the highest price comes
//!   first without a custom comparator.
//! - Each price level is a `VecDeque`, FIFO within the level.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::core_types::{Cents, OrderId};
use crate::models::{Order, OrderKind, Side};

/// One aggregated price level of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Level {
    pub price: Cents,
    pub quantity: u64,
}

/// Resting orders for one (market, side).
#[derive(Debug, Default)]
pub struct SideBook {
    /// Buy orders: (MAX - price) -> FIFO queue (highest price first)
    bids: BTreeMap<u64, VecDeque<Order>>,
    /// Sell orders: price -> FIFO queue (lowest price first)
    asks: BTreeMap<u64, VecDeque<Order>>,
}

/// Snapshot of a maker order right after a fill against it.
#[derive(Debug, Clone)]
pub struct MakerFill {
    /// The maker order in its post-fill state.
    pub order: Order,
    /// Quantity filled by this hit.
    pub filled: u64,
}

impl SideBook {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn best_bid(&self) -> Option<Cents> {
        self.bids.first_key_value().map(|(k, _)| u64::MAX - k)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<Cents> {
        self.asks.first_key_value().map(|(k, _)| *k)
    }

    /// Remaining quantity of the order at the front of the best bid level.
    pub fn best_bid_front(&self) -> Option<&Order> {
        self.bids.first_key_value().and_then(|(_, q)| q.front())
    }

    pub fn best_ask_front(&self) -> Option<&Order> {
        self.asks.first_key_value().and_then(|(_, q)| q.front())
    }

    /// Rest an order. Status must already be correct; the book only stores.
    pub fn rest(&mut self, order: Order) {
        match order.kind {
            OrderKind::Buy => {
                self.bids
                    .entry(u64::MAX - order.price)
                    .or_default()
                    .push_back(order);
            }
            OrderKind::Sell => {
                self.asks.entry(order.price).or_default().push_back(order);
            }
        }
    }

    /// Fill up to `qty` against the front order of the best ask level.
    /// Pops the maker when fully filled and prunes the empty level.
    pub fn fill_best_ask(&mut self, qty: u64) -> Option<MakerFill> {
        Self::fill_front(&mut self.asks, qty)
    }

    /// Fill up to `qty` against the front order of the best bid level.
    pub fn fill_best_bid(&mut self, qty: u64) -> Option<MakerFill> {
        Self::fill_front(&mut self.bids, qty)
    }

    fn fill_front(tree: &mut BTreeMap<u64, VecDeque<Order>>, qty: u64) -> Option<MakerFill> {
        let mut entry = tree.first_entry()?;
        let queue = entry.get_mut();
        let front = queue.front_mut()?;

        let filled = qty.min(front.remaining());
        front.filled += filled;
        front.refresh_status();
        let snapshot = front.clone();

        if front.is_filled() {
            queue.pop_front();
        }
        if queue.is_empty() {
            entry.remove();
        }
        Some(MakerFill {
            order: snapshot,
            filled,
        })
    }

    /// Remove an order by id, searching the whole side. O(n).
    pub fn cancel(&mut self, order_id: OrderId) -> Option<Order> {
        for tree in [&mut self.bids, &mut self.asks] {
            let mut hit = None;
            for (key, queue) in tree.iter_mut() {
                if let Some(pos) = queue.iter().position(|o| o.id == order_id) {
                    let order = queue.remove(pos);
                    hit = Some((*key, order));
                    break;
                }
            }
            if let Some((key, order)) = hit {
                if tree.get(&key).is_some_and(|q| q.is_empty()) {
                    tree.remove(&key);
                }
                return order;
            }
        }
        None
    }

    /// Remove and return every resting order (resolution / deletion).
    pub fn drain(&mut self) -> Vec<Order> {
        let mut out: Vec<Order> = self
            .bids
            .values_mut()
            .flat_map(|q| q.drain(..))
            .chain(self.asks.values_mut().flat_map(|q| q.drain(..)))
            .collect();
        self.bids.clear();
        self.asks.clear();
        // Cancellation refunds in arrival order, for a stable audit trail
        out.sort_by_key(|o| o.created_at_ms);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.bids
            .values()
            .flat_map(|q| q.iter())
            .chain(self.asks.values().flat_map(|q| q.iter()))
    }

    /// Aggregated levels up to `depth`: (bids best-first, asks best-first).
    pub fn levels(&self, depth: usize) -> (Vec<Level>, Vec<Level>) {
        let bids = self
            .bids
            .iter()
            .take(depth)
            .map(|(k, q)| Level {
                price: u64::MAX - k,
                quantity: q.iter().map(|o| o.remaining()).sum(),
            })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(depth)
            .map(|(price, q)| Level {
                price: *price,
                quantity: q.iter().map(|o| o.remaining()).sum(),
            })
            .collect();
        (bids, asks)
    }
}

/// Aggregated view of one side's book.
#[derive(Debug, Clone, Serialize)]
pub struct SideLevels {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

/// Published orderbook state: both sides plus midpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub yes: SideLevels,
    pub no: SideLevels,
    pub midpoint_yes: Cents,
    pub midpoint_no: Cents,
}

/// The two side books of one market plus last-trade memory for the
/// midpoint fallback.
#[derive(Debug, Default)]
pub struct MarketBook {
    yes: SideBook,
    no: SideBook,
    last_trade_yes: Option<Cents>,
    last_trade_no: Option<Cents>,
}

impl MarketBook {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn side(&self, side: Side) -> &SideBook {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }

    #[inline]
    pub fn side_mut(&mut self, side: Side) -> &mut SideBook {
        match side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        }
    }

    /// Remember the last executed price on a side (midpoint fallback).
    pub fn record_trade(&mut self, side: Side, price: Cents) {
        match side {
            Side::Yes => self.last_trade_yes = Some(price),
            Side::No => self.last_trade_no = Some(price),
        }
    }

    /// Midpoint: `(best_bid + best_ask) / 2` when both sides are quoted,
    /// else the last trade price, else 50c.
    pub fn midpoint(&self, side: Side) -> Cents {
        let book = self.side(side);
        let last = match side {
            Side::Yes => self.last_trade_yes,
            Side::No => self.last_trade_no,
        };
        match (book.best_bid(), book.best_ask()) {
            (Some(bid), Some(ask)) => (bid + ask) / 2,
            _ => last.unwrap_or(50),
        }
    }

    /// Cancel an order wherever it rests.
    pub fn cancel(&mut self, order_id: OrderId) -> Option<Order> {
        self.yes.cancel(order_id).or_else(|| self.no.cancel(order_id))
    }

    /// Drain every resting order from both sides.
    pub fn drain_all(&mut self) -> Vec<Order> {
        let mut out = self.yes.drain();
        out.extend(self.no.drain());
        out.sort_by_key(|o| o.created_at_ms);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.yes.iter().chain(self.no.iter())
    }

    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let (yes_bids, yes_asks) = self.yes.levels(depth);
        let (no_bids, no_asks) = self.no.levels(depth);
        BookSnapshot {
            yes: SideLevels {
                bids: yes_bids,
                asks: yes_asks,
            },
            no: SideLevels {
                bids: no_bids,
                asks: no_asks,
            },
            midpoint_yes: self.midpoint(Side::Yes),
            midpoint_no: self.midpoint(Side::No),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy(id: OrderId, price: Cents, qty: u64, at: u64) -> Order {
        Order::new(id, 1, id, Side::Yes, OrderKind::Buy, price, qty, at)
    }

    fn sell(id: OrderId, price: Cents, qty: u64, at: u64) -> Order {
        Order::new(id, 1, id, Side::Yes, OrderKind::Sell, price, qty, at)
    }

    #[test]
    fn best_prices() {
        let mut book = SideBook::new();
        book.rest(buy(1, 60, 10, 0));
        book.rest(buy(2, 58, 10, 1));
        book.rest(sell(3, 65, 5, 2));
        book.rest(sell(4, 63, 5, 3));

        assert_eq!(book.best_bid(), Some(60));
        assert_eq!(book.best_ask(), Some(63));
    }

    #[test]
    fn fill_best_ask_fifo_and_prune() {
        let mut book = SideBook::new();
        book.rest(sell(1, 60, 5, 0));
        book.rest(sell(2, 60, 5, 1));

        let hit = book.fill_best_ask(3).unwrap();
        assert_eq!(hit.order.id, 1);
        assert_eq!(hit.filled, 3);
        assert_eq!(hit.order.remaining(), 2);

        // Finish order 1; order 2 becomes the front
        let hit = book.fill_best_ask(10).unwrap();
        assert_eq!(hit.order.id, 1);
        assert_eq!(hit.filled, 2);
        let hit = book.fill_best_ask(10).unwrap();
        assert_eq!(hit.order.id, 2);
        assert_eq!(hit.filled, 5);
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn cancel_removes_and_prunes_level() {
        let mut book = SideBook::new();
        book.rest(buy(1, 60, 10, 0));
        let cancelled = book.cancel(1).unwrap();
        assert_eq!(cancelled.id, 1);
        assert_eq!(book.best_bid(), None);
        assert!(book.cancel(99).is_none());
    }

    #[test]
    fn levels_aggregate_remaining_qty() {
        let mut book = SideBook::new();
        book.rest(buy(1, 60, 10, 0));
        let mut partially = buy(2, 60, 10, 1);
        partially.filled = 4;
        book.rest(partially);
        book.rest(buy(3, 55, 7, 2));

        let (bids, _) = book.levels(10);
        assert_eq!(bids[0], Level { price: 60, quantity: 16 });
        assert_eq!(bids[1], Level { price: 55, quantity: 7 });
    }

    #[test]
    fn midpoint_fallbacks() {
        let mut book = MarketBook::new();
        // Empty book, no history: 50c
        assert_eq!(book.midpoint(Side::Yes), 50);

        book.record_trade(Side::Yes, 62);
        assert_eq!(book.midpoint(Side::Yes), 62);

        book.side_mut(Side::Yes).rest(buy(1, 60, 10, 0));
        // Only a bid: still last trade
        assert_eq!(book.midpoint(Side::Yes), 62);

        book.side_mut(Side::Yes).rest(sell(2, 70, 10, 1));
        assert_eq!(book.midpoint(Side::Yes), 65);
    }

    #[test]
    fn drain_returns_everything_in_arrival_order() {
        let mut book = MarketBook::new();
        book.side_mut(Side::Yes).rest(buy(1, 60, 10, 5));
        book.side_mut(Side::No).rest(buy(2, 40, 10, 3));
        book.side_mut(Side::Yes).rest(sell(3, 70, 2, 4));

        let drained = book.drain_all();
        assert_eq!(drained.iter().map(|o| o.id).collect::<Vec<_>>(), vec![2, 3, 1]);
        assert!(book.iter().next().is_none());
    }
}
