//! Matching engine - per-market trading core
//!
//! One [`MarketEngine`] per market, driven by exactly one command at a
//! time (the worker serialises them). Each command either commits a whole
//! [`Report`] - orderbook, ledger and trade log mutated together - or
//! returns an error with no side effects.
//!
//! Failure ordering: every check that can reject a command (validation,
//! escrow lock, share reserve) runs before the first book mutation.
//! Once matching starts, ledger operations are infallible by invariant;
//! a failure there is corruption and surfaces as [`EngineError::Fatal`],
//! which halts the market's worker.
//!
//! # Matching (limit BUY on side S at price p)
//! 1. Same-side match against SELL S asks priced <= p, at the maker's
//!    price, refunding the buyer the difference out of escrow.
//! 2. Cross-side mint against BUY !S bids where `p + bid >= 100`: a new
//!    YES+NO pair is created, each leg paying its stated price minus its
//!    half of the surplus `p + bid - 100` (the odd cent goes to the
//!    resting leg).
//! Per unit the engine takes whichever of 1/2 is cheaper for the
//! incoming order; ties prefer the match to keep share supply minimal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bus::{EventBus, MarketEvent, PortfolioDelta, PushEvent};
use crate::clock::Clock;
use crate::core_types::{Cents, OrderId, TradeId, UserId, MAX_PRICE, MIN_PRICE, TOKEN_CENTS};
use crate::ledger::{CommitSummary, Ledger, Transaction};
use crate::messages::{Command, EngineError, MarketOrderSpec, Report};
use crate::models::{
    Market, MarketStatus, Order, OrderKind, OrderStatus, Outcome, Side, Trade, TradeKind,
};
use crate::orderbook::{BookSnapshot, MarketBook};
use crate::resolver;
use crate::store::{Persistence, StoreError};

/// Shared id allocation for orders and trades across all markets.
pub struct IdGen {
    order: AtomicU64,
    trade: AtomicU64,
}

impl IdGen {
    pub fn new(next_order: OrderId, next_trade: TradeId) -> Arc<Self> {
        Arc::new(Self {
            order: AtomicU64::new(next_order),
            trade: AtomicU64::new(next_trade),
        })
    }

    pub fn next_order_id(&self) -> OrderId {
        self.order.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_trade_id(&self) -> TradeId {
        self.trade.fetch_add(1, Ordering::Relaxed)
    }
}

/// Accumulated effects of one command's fills.
#[derive(Default)]
struct FillAcc {
    trades: Vec<Trade>,
    /// Maker orders (and STP-expired own orders) in post-fill state.
    maker_orders: Vec<Order>,
    spent: Cents,
    refunded: Cents,
    received: Cents,
    volume: Cents,
    filled: u64,
}

/// Per-unit terms of a prospective mint against the opposite best bid.
#[derive(Clone, Copy)]
struct MintQuote {
    maker_price: Cents,
    taker_cost: Cents,
    maker_cost: Cents,
}

enum TakerChoice {
    Match(Cents),
    Mint(MintQuote),
}

pub struct MarketEngine {
    market: Market,
    book: MarketBook,
    ledger: Arc<Mutex<Ledger>>,
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    ids: Arc<IdGen>,
    snapshot_depth: usize,
}

impl MarketEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        market: Market,
        book: MarketBook,
        ledger: Arc<Mutex<Ledger>>,
        store: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        ids: Arc<IdGen>,
        snapshot_depth: usize,
    ) -> Self {
        Self {
            market,
            book,
            ledger,
            store,
            clock,
            bus,
            ids,
            snapshot_depth,
        }
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn snapshot(&self) -> BookSnapshot {
        self.book.snapshot(self.snapshot_depth)
    }

    /// Process one command to completion.
    pub fn handle(&mut self, cmd: Command) -> Result<Report, EngineError> {
        match cmd {
            Command::PlaceLimit {
                user,
                side,
                kind,
                price,
                quantity,
            } => self.place_limit(user, side, kind, price, quantity),
            Command::PlaceMarket { user, side, spec } => match spec {
                MarketOrderSpec::BuyBudget(budget) => self.market_buy(user, side, budget),
                MarketOrderSpec::SellQuantity(qty) => self.market_sell(user, side, qty),
            },
            Command::Cancel { order_id, user } => self.cancel(order_id, user),
            Command::Resolve { outcome } => self.resolve(outcome),
            Command::Delete => self.delete(),
        }
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        if self.market.is_active() {
            Ok(())
        } else {
            Err(EngineError::MarketClosed)
        }
    }

    // ========================================================
    // LIMIT ORDERS
    // ========================================================

    fn place_limit(
        &mut self,
        user: UserId,
        side: Side,
        kind: OrderKind,
        price: Cents,
        quantity: u64,
    ) -> Result<Report, EngineError> {
        self.ensure_active()?;
        if !(MIN_PRICE..=MAX_PRICE).contains(&price) {
            return Err(EngineError::InvalidOrder(format!(
                "price must be {}..={} cents, got {}",
                MIN_PRICE, MAX_PRICE, price
            )));
        }
        if quantity == 0 {
            return Err(EngineError::InvalidOrder("quantity must be positive".into()));
        }
        // Escrow is price x quantity; reject sizes that cannot be priced
        let Some(escrow) = price.checked_mul(quantity) else {
            return Err(EngineError::InvalidOrder("order size overflows".into()));
        };

        let scope = self.market.scope;
        let market_id = self.market.id;
        let ledger = Arc::clone(&self.ledger);
        let mut guard = ledger
            .lock()
            .map_err(|_| EngineError::Fatal("ledger lock poisoned".into()))?;
        let mut txn = guard.begin();

        let mut order = Order::new(
            self.ids.next_order_id(),
            market_id,
            user,
            side,
            kind,
            price,
            quantity,
            self.clock.now_ms(),
        );
        let mut acc = FillAcc::default();

        match kind {
            OrderKind::Buy => {
                // Escrow the full order up front; refunds come per fill
                txn.reserve_tokens(user, scope, escrow)
                    .map_err(EngineError::from)?;
                self.match_limit_buy(&mut txn, &mut order, &mut acc)?;
            }
            OrderKind::Sell => {
                txn.reserve_shares(user, market_id, side, quantity)
                    .map_err(EngineError::from)?;
                self.match_limit_sell(&mut txn, &mut order, &mut acc)?;
            }
        }

        order.refresh_status();
        if !order.is_filled() {
            self.book.side_mut(side).rest(order.clone());
        }
        acc.filled = order.filled;

        let summary = txn.commit().map_err(EngineError::from)?;
        let deltas = self.portfolio_deltas(&guard, &summary);
        drop(guard);

        let mut orders = vec![order.clone()];
        orders.extend(acc.maker_orders.drain(..));
        self.finish(&summary, &orders, &acc)?;

        Ok(Report {
            order: Some(order),
            trades: acc.trades,
            tokens_spent: acc.spent,
            tokens_refunded: acc.refunded,
            tokens_received: acc.received,
            shares_filled: acc.filled,
            shares_released: 0,
        }
        .tap_publish(self, deltas))
    }

    fn match_limit_buy(
        &mut self,
        txn: &mut Transaction<'_>,
        order: &mut Order,
        acc: &mut FillAcc,
    ) -> Result<(), EngineError> {
        let side = order.side;
        let opp = side.opposite();
        let p = order.price;
        let user = order.user_id;
        let scope = self.market.scope;
        let market_id = self.market.id;

        while !order.is_filled() {
            let match_price = self.book.side(side).best_ask().filter(|a| *a <= p);
            let mint_quote = self
                .book
                .side(opp)
                .best_bid()
                .filter(|b| p + *b >= TOKEN_CENTS)
                .map(|b| {
                    let surplus = p + b - TOKEN_CENTS;
                    let taker_half = surplus / 2;
                    MintQuote {
                        maker_price: b,
                        taker_cost: p - taker_half,
                        maker_cost: b - (surplus - taker_half),
                    }
                });

            let choice = match (match_price, mint_quote) {
                (None, None) => break,
                (Some(a), None) => TakerChoice::Match(a),
                (None, Some(m)) => TakerChoice::Mint(m),
                // Equal cost prefers the match: no new share supply
                (Some(a), Some(m)) => {
                    if a <= m.taker_cost {
                        TakerChoice::Match(a)
                    } else {
                        TakerChoice::Mint(m)
                    }
                }
            };

            // Self-trade prevention: never trade against an own resting
            // order; expire it (cancel + refund) and re-quote instead.
            let chosen_front = match &choice {
                TakerChoice::Match(_) => self.book.side(side).best_ask_front(),
                TakerChoice::Mint(_) => self.book.side(opp).best_bid_front(),
            };
            if let Some(own_id) = chosen_front.filter(|o| o.user_id == user).map(|o| o.id) {
                self.expire_own_maker(txn, acc, own_id)?;
                continue;
            }

            match choice {
                TakerChoice::Match(ask) => {
                    self.fill_buy_match(txn, order, acc, ask, order.remaining())?;
                }
                TakerChoice::Mint(quote) => {
                    self.fill_mint(txn, acc, order, side, quote, order.remaining())?;
                }
            }
        }
        Ok(())
    }

    /// One fill of an incoming BUY against the best same-side ask.
    fn fill_buy_match(
        &mut self,
        txn: &mut Transaction<'_>,
        order: &mut Order,
        acc: &mut FillAcc,
        ask: Cents,
        want: u64,
    ) -> Result<(), EngineError> {
        let side = order.side;
        let user = order.user_id;
        let scope = self.market.scope;
        let market_id = self.market.id;

        let maker = self
            .book
            .side_mut(side)
            .fill_best_ask(want)
            .ok_or_else(|| EngineError::Fatal("quoted ask vanished".into()))?;
        let qty = maker.filled;
        order.filled += qty;

        // Buyer pays the maker price out of escrow and gets the
        // difference to their own price back.
        txn.debit_tokens(user, scope, ask * qty)?;
        acc.spent += ask * qty;
        if order.price > ask {
            let refund = (order.price - ask) * qty;
            txn.release_tokens(user, scope, refund)?;
            acc.refunded += refund;
        }
        txn.credit_tokens(maker.order.user_id, scope, ask * qty)?;
        txn.transfer_shares(maker.order.user_id, user, market_id, side, qty, ask)?;

        acc.trades.push(Trade {
            id: self.ids.next_trade_id(),
            market_id,
            kind: TradeKind::Match,
            side,
            price: ask,
            quantity: qty,
            buyer_id: user,
            seller_id: Some(maker.order.user_id),
            buyer_order_id: order.id,
            seller_order_id: Some(maker.order.id),
            executed_at_ms: self.clock.now_ms(),
        });
        self.book.record_trade(side, ask);
        acc.volume += ask * qty;
        acc.maker_orders.push(maker.order);
        Ok(())
    }

    /// One mint between a buyer on `side` and the opposite best bid.
    fn fill_mint(
        &mut self,
        txn: &mut Transaction<'_>,
        acc: &mut FillAcc,
        order: &mut Order,
        side: Side,
        quote: MintQuote,
        want: u64,
    ) -> Result<(), EngineError> {
        let user = order.user_id;
        let opp = side.opposite();
        let scope = self.market.scope;
        let market_id = self.market.id;

        let maker = self
            .book
            .side_mut(opp)
            .fill_best_bid(want)
            .ok_or_else(|| EngineError::Fatal("quoted bid vanished".into()))?;
        let qty = maker.filled;
        order.filled += qty;

        // Incoming leg: escrowed at its own price, pays its effective cost
        txn.debit_tokens(user, scope, quote.taker_cost * qty)?;
        acc.spent += quote.taker_cost * qty;
        if order.price > quote.taker_cost {
            let refund = (order.price - quote.taker_cost) * qty;
            txn.release_tokens(user, scope, refund)?;
            acc.refunded += refund;
        }
        // Resting leg: escrowed at its own price, surplus share refunded
        txn.debit_tokens(maker.order.user_id, scope, quote.maker_cost * qty)?;
        if quote.maker_price > quote.maker_cost {
            txn.release_tokens(
                maker.order.user_id,
                scope,
                (quote.maker_price - quote.maker_cost) * qty,
            )?;
        }

        txn.mint_shares(user, market_id, side, qty, quote.taker_cost)?;
        txn.mint_shares(maker.order.user_id, market_id, opp, qty, quote.maker_cost)?;

        // MINT trades are normalised to the YES leg
        let (yes_user, yes_order_id, yes_cost) = if side == Side::Yes {
            (user, order.id, quote.taker_cost)
        } else {
            (maker.order.user_id, maker.order.id, quote.maker_cost)
        };
        acc.trades.push(Trade {
            id: self.ids.next_trade_id(),
            market_id,
            kind: TradeKind::Mint,
            side: Side::Yes,
            price: yes_cost,
            quantity: qty,
            buyer_id: yes_user,
            seller_id: None,
            buyer_order_id: yes_order_id,
            seller_order_id: None,
            executed_at_ms: self.clock.now_ms(),
        });
        self.book.record_trade(Side::Yes, yes_cost);
        self.book.record_trade(Side::No, TOKEN_CENTS - yes_cost);
        acc.volume += TOKEN_CENTS * qty;
        acc.maker_orders.push(maker.order);
        Ok(())
    }

    fn match_limit_sell(
        &mut self,
        txn: &mut Transaction<'_>,
        order: &mut Order,
        acc: &mut FillAcc,
    ) -> Result<(), EngineError> {
        let side = order.side;
        let p = order.price;
        let user = order.user_id;

        while !order.is_filled() {
            if self.book.side(side).best_bid().filter(|b| *b >= p).is_none() {
                break;
            }
            if let Some(own_id) = self
                .book
                .side(side)
                .best_bid_front()
                .filter(|o| o.user_id == user)
                .map(|o| o.id)
            {
                self.expire_own_maker(txn, acc, own_id)?;
                continue;
            }
            // Execution at the sell's own price; the resting buyer is
            // refunded down to it (price improvement goes to the buyer)
            self.fill_sell_match(txn, order, acc, p, order.remaining())?;
        }
        Ok(())
    }

    /// One fill of an incoming SELL against the best same-side bid, at
    /// `exec_price` (<= the resting bid). The resting buyer escrowed at
    /// their own price; the difference comes back out of escrow.
    fn fill_sell_match(
        &mut self,
        txn: &mut Transaction<'_>,
        order: &mut Order,
        acc: &mut FillAcc,
        exec_price: Cents,
        want: u64,
    ) -> Result<(), EngineError> {
        let side = order.side;
        let user = order.user_id;
        let scope = self.market.scope;
        let market_id = self.market.id;

        let maker = self
            .book
            .side_mut(side)
            .fill_best_bid(want)
            .ok_or_else(|| EngineError::Fatal("quoted bid vanished".into()))?;
        let qty = maker.filled;
        let bid = maker.order.price;
        order.filled += qty;

        txn.debit_tokens(maker.order.user_id, scope, exec_price * qty)?;
        if bid > exec_price {
            txn.release_tokens(maker.order.user_id, scope, (bid - exec_price) * qty)?;
        }
        txn.credit_tokens(user, scope, exec_price * qty)?;
        acc.received += exec_price * qty;
        txn.transfer_shares(user, maker.order.user_id, market_id, side, qty, exec_price)?;

        acc.trades.push(Trade {
            id: self.ids.next_trade_id(),
            market_id,
            kind: TradeKind::Match,
            side,
            price: exec_price,
            quantity: qty,
            buyer_id: maker.order.user_id,
            seller_id: Some(user),
            buyer_order_id: maker.order.id,
            seller_order_id: Some(order.id),
            executed_at_ms: self.clock.now_ms(),
        });
        self.book.record_trade(side, exec_price);
        acc.volume += exec_price * qty;
        acc.maker_orders.push(maker.order);
        Ok(())
    }

    /// Expire-maker self-trade prevention: cancel an own resting order
    /// that the incoming order is about to cross, with a full refund.
    fn expire_own_maker(
        &mut self,
        txn: &mut Transaction<'_>,
        acc: &mut FillAcc,
        order_id: OrderId,
    ) -> Result<(), EngineError> {
        let mut expired = self
            .book
            .cancel(order_id)
            .ok_or_else(|| EngineError::Fatal("own maker vanished".into()))?;
        match expired.kind {
            OrderKind::Buy => txn.release_tokens(
                expired.user_id,
                self.market.scope,
                expired.remaining_escrow(),
            )?,
            OrderKind::Sell => txn.release_shares(
                expired.user_id,
                self.market.id,
                expired.side,
                expired.remaining(),
            )?,
        }
        expired.status = OrderStatus::Cancelled;
        tracing::debug!(
            order_id,
            user = expired.user_id,
            "own resting order expired (self-trade prevention)"
        );
        acc.maker_orders.push(expired);
        Ok(())
    }

    // ========================================================
    // MARKET ORDERS
    // ========================================================

    /// BUY with a token budget: per unit, take the cheaper of the best
    /// same-side ask (match) and `100 - best opposite bid` (mint).
    /// Leftover budget is refunded; market orders never rest.
    fn market_buy(&mut self, user: UserId, side: Side, budget: Cents) -> Result<Report, EngineError> {
        self.ensure_active()?;
        if budget == 0 {
            return Err(EngineError::InvalidOrder("budget must be positive".into()));
        }

        let opp = side.opposite();
        let scope = self.market.scope;
        let market_id = self.market.id;
        let ledger = Arc::clone(&self.ledger);
        let mut guard = ledger
            .lock()
            .map_err(|_| EngineError::Fatal("ledger lock poisoned".into()))?;
        let mut txn = guard.begin();

        txn.reserve_tokens(user, scope, budget)
            .map_err(EngineError::from)?;

        // Synthetic taker record so fills share the limit-order plumbing.
        // It is never persisted or rested.
        let mut taker = Order::new(
            self.ids.next_order_id(),
            market_id,
            user,
            side,
            OrderKind::Buy,
            MAX_PRICE,
            u64::MAX,
            self.clock.now_ms(),
        );
        let mut acc = FillAcc::default();
        let mut remaining_budget = budget;

        loop {
            let match_price = self.book.side(side).best_ask();
            // A budget buyer has no stated price, so a mint charges
            // exactly what the resting bid leaves uncovered.
            let mint_quote = self.book.side(opp).best_bid().map(|b| MintQuote {
                maker_price: b,
                taker_cost: TOKEN_CENTS - b,
                maker_cost: b,
            });

            let choice = match (match_price, mint_quote) {
                (None, None) => break,
                (Some(a), None) => TakerChoice::Match(a),
                (None, Some(m)) => TakerChoice::Mint(m),
                (Some(a), Some(m)) => {
                    if a <= m.taker_cost {
                        TakerChoice::Match(a)
                    } else {
                        TakerChoice::Mint(m)
                    }
                }
            };
            let unit_cost = match &choice {
                TakerChoice::Match(a) => *a,
                TakerChoice::Mint(m) => m.taker_cost,
            };
            let affordable = remaining_budget / unit_cost;
            if affordable == 0 {
                break;
            }

            let chosen_front = match &choice {
                TakerChoice::Match(_) => self.book.side(side).best_ask_front(),
                TakerChoice::Mint(_) => self.book.side(opp).best_bid_front(),
            };
            if let Some(own_id) = chosen_front.filter(|o| o.user_id == user).map(|o| o.id) {
                self.expire_own_maker(&mut txn, &mut acc, own_id)?;
                continue;
            }

            // Price the taker at exactly the unit cost so the shared fill
            // path debits the reserved budget without a price refund.
            taker.price = unit_cost;
            let filled_before = taker.filled;
            match choice {
                TakerChoice::Match(ask) => {
                    self.fill_buy_match(&mut txn, &mut taker, &mut acc, ask, affordable)?;
                }
                TakerChoice::Mint(quote) => {
                    self.fill_mint(&mut txn, &mut acc, &mut taker, side, quote, affordable)?;
                }
            }
            let qty = taker.filled - filled_before;
            remaining_budget -= unit_cost * qty;
        }

        // Leftover budget straight back to available
        if remaining_budget > 0 {
            txn.release_tokens(user, scope, remaining_budget)
                .map_err(EngineError::from)?;
            acc.refunded += remaining_budget;
        }
        acc.filled = taker.filled;

        let summary = txn.commit().map_err(EngineError::from)?;
        let deltas = self.portfolio_deltas(&guard, &summary);
        drop(guard);

        let mut orders = std::mem::take(&mut acc.maker_orders);
        if taker.filled > 0 {
            // Record the executed market order; it never rests.
            taker.quantity = taker.filled;
            taker.refresh_status();
            orders.push(taker);
        }
        self.finish(&summary, &orders, &acc)?;

        Ok(Report {
            order: None,
            trades: acc.trades,
            tokens_spent: acc.spent,
            tokens_refunded: acc.refunded,
            tokens_received: 0,
            shares_filled: acc.filled,
            shares_released: 0,
        }
        .tap_publish(self, deltas))
    }

    /// SELL a share quantity into the best same-side bids. Unfilled
    /// remainder is released back to the position and reported.
    fn market_sell(&mut self, user: UserId, side: Side, quantity: u64) -> Result<Report, EngineError> {
        self.ensure_active()?;
        if quantity == 0 {
            return Err(EngineError::InvalidOrder("quantity must be positive".into()));
        }

        let scope = self.market.scope;
        let market_id = self.market.id;
        let ledger = Arc::clone(&self.ledger);
        let mut guard = ledger
            .lock()
            .map_err(|_| EngineError::Fatal("ledger lock poisoned".into()))?;
        let mut txn = guard.begin();

        txn.reserve_shares(user, market_id, side, quantity)
            .map_err(EngineError::from)?;

        let mut taker = Order::new(
            self.ids.next_order_id(),
            market_id,
            user,
            side,
            OrderKind::Sell,
            MIN_PRICE,
            quantity,
            self.clock.now_ms(),
        );
        let mut acc = FillAcc::default();

        while !taker.is_filled() {
            let Some(bid) = self.book.side(side).best_bid() else {
                break;
            };
            if let Some(own_id) = self
                .book
                .side(side)
                .best_bid_front()
                .filter(|o| o.user_id == user)
                .map(|o| o.id)
            {
                self.expire_own_maker(&mut txn, &mut acc, own_id)?;
                continue;
            }
            let remaining = taker.remaining();
            self.fill_sell_match(&mut txn, &mut taker, &mut acc, bid, remaining)?;
        }

        let unfilled = taker.remaining();
        if unfilled > 0 {
            txn.release_shares(user, market_id, side, unfilled)
                .map_err(EngineError::from)?;
        }
        acc.filled = taker.filled;

        let summary = txn.commit().map_err(EngineError::from)?;
        let deltas = self.portfolio_deltas(&guard, &summary);
        drop(guard);

        let mut orders = std::mem::take(&mut acc.maker_orders);
        if taker.filled > 0 {
            taker.quantity = taker.filled;
            taker.refresh_status();
            orders.push(taker);
        }
        self.finish(&summary, &orders, &acc)?;

        Ok(Report {
            order: None,
            trades: acc.trades,
            tokens_spent: 0,
            tokens_refunded: 0,
            tokens_received: acc.received,
            shares_filled: acc.filled,
            shares_released: unfilled,
        }
        .tap_publish(self, deltas))
    }

    // ========================================================
    // CANCEL / RESOLVE / DELETE
    // ========================================================

    fn cancel(&mut self, order_id: OrderId, user: UserId) -> Result<Report, EngineError> {
        self.ensure_active()?;

        let Some(resting) = self.book.iter().find(|o| o.id == order_id) else {
            // Not resting: closed order, foreign order, or unknown id
            return match self.store.order(order_id) {
                Ok(Some(o)) if o.market_id == self.market.id && o.user_id == user => {
                    Err(EngineError::Conflict("order is not open".into()))
                }
                Ok(Some(o)) if o.market_id == self.market.id => Err(EngineError::NotAuthorized),
                Ok(_) => Err(EngineError::NotFound),
                Err(_) => Err(EngineError::ServiceUnavailable),
            };
        };
        if resting.user_id != user {
            return Err(EngineError::NotAuthorized);
        }

        let ledger = Arc::clone(&self.ledger);
        let mut guard = ledger
            .lock()
            .map_err(|_| EngineError::Fatal("ledger lock poisoned".into()))?;
        let mut txn = guard.begin();

        let mut order = self
            .book
            .cancel(order_id)
            .ok_or_else(|| EngineError::Fatal("resting order vanished".into()))?;

        let mut refunded = 0;
        let mut released = 0;
        match order.kind {
            OrderKind::Buy => {
                refunded = order.remaining_escrow();
                txn.release_tokens(user, self.market.scope, refunded)?;
            }
            OrderKind::Sell => {
                released = order.remaining();
                txn.release_shares(user, self.market.id, order.side, released)?;
            }
        }
        order.status = OrderStatus::Cancelled;

        let summary = txn.commit().map_err(EngineError::from)?;
        let deltas = self.portfolio_deltas(&guard, &summary);
        drop(guard);

        let acc = FillAcc::default();
        self.finish(&summary, std::slice::from_ref(&order), &acc)?;

        Ok(Report {
            order: Some(order),
            tokens_refunded: refunded,
            shares_released: released,
            ..Default::default()
        }
        .tap_publish(self, deltas))
    }

    fn resolve(&mut self, outcome: Outcome) -> Result<Report, EngineError> {
        self.ensure_active()?;

        let ledger = Arc::clone(&self.ledger);
        let mut guard = ledger
            .lock()
            .map_err(|_| EngineError::Fatal("ledger lock poisoned".into()))?;
        let holders = guard.positions_in_market(self.market.id);
        let mut txn = guard.begin();

        let cancelled = resolver::cancel_all_open(&mut self.book, &mut txn, &self.market)
            .map_err(EngineError::from)?;
        let paid = resolver::payout_resolution(&mut txn, &holders, &self.market, outcome)
            .map_err(EngineError::from)?;

        let summary = txn.commit().map_err(EngineError::from)?;
        let deltas = self.portfolio_deltas(&guard, &summary);
        drop(guard);

        self.market.status = MarketStatus::Resolved;
        self.market.outcome = Some(outcome);
        tracing::info!(
            market_id = self.market.id,
            ?outcome,
            paid,
            cancelled = cancelled.len(),
            "market resolved"
        );

        let acc = FillAcc::default();
        self.finish(&summary, &cancelled, &acc)?;
        self.bus.publish(PushEvent::Market(MarketEvent::MarketResolved {
            market_id: self.market.id,
            outcome,
        }));

        Ok(Report::default().tap_publish(self, deltas))
    }

    fn delete(&mut self) -> Result<Report, EngineError> {
        self.ensure_active()?;

        let ledger = Arc::clone(&self.ledger);
        let mut guard = ledger
            .lock()
            .map_err(|_| EngineError::Fatal("ledger lock poisoned".into()))?;
        let holders = guard.positions_in_market(self.market.id);
        let mut txn = guard.begin();

        let cancelled = resolver::cancel_all_open(&mut self.book, &mut txn, &self.market)
            .map_err(EngineError::from)?;
        let refunded = resolver::refund_deletion(&mut txn, &holders, &self.market)
            .map_err(EngineError::from)?;

        let summary = txn.commit().map_err(EngineError::from)?;
        let deltas = self.portfolio_deltas(&guard, &summary);
        drop(guard);

        self.market.status = MarketStatus::Deleted;
        tracing::info!(
            market_id = self.market.id,
            refunded,
            cancelled = cancelled.len(),
            "market deleted"
        );

        let acc = FillAcc::default();
        self.finish(&summary, &cancelled, &acc)?;
        self.bus.publish(PushEvent::Market(MarketEvent::MarketDeleted {
            market_id: self.market.id,
        }));

        Ok(Report {
            tokens_refunded: refunded,
            ..Default::default()
        }
        .tap_publish(self, deltas))
    }

    // ========================================================
    // COMMIT TAIL: persistence + events
    // ========================================================

    /// Persist everything a committed command touched, update display
    /// prices and volume, and publish market events. Persistence errors
    /// are retried a few times and then surfaced as transient.
    fn finish(
        &mut self,
        summary: &CommitSummary,
        orders: &[Order],
        acc: &FillAcc,
    ) -> Result<(), EngineError> {
        self.market.volume += acc.volume;
        self.market.yes_price = self.book.midpoint(Side::Yes);
        self.market.no_price = self.book.midpoint(Side::No);

        with_retry(|| {
            for order in orders {
                self.store.save_order(order)?;
            }
            for trade in &acc.trades {
                self.store.append_trade(trade)?;
            }
            for (user, scope, balance) in &summary.balances {
                self.store.save_balance(*user, *scope, *balance)?;
            }
            for (user, market, position) in &summary.positions {
                self.store.save_position(*user, *market, position)?;
            }
            self.store.save_market(&self.market)
        })?;

        for trade in &acc.trades {
            self.bus.publish(PushEvent::Market(MarketEvent::TradeExecuted {
                market_id: self.market.id,
                trade: trade.clone(),
                minted: trade.kind == TradeKind::Mint,
            }));
        }
        Ok(())
    }

    fn portfolio_deltas(&self, ledger: &Ledger, summary: &CommitSummary) -> Vec<PortfolioDelta> {
        let mut users: Vec<UserId> = summary
            .balances
            .iter()
            .map(|(u, _, _)| *u)
            .chain(summary.positions.iter().map(|(u, _, _)| *u))
            .collect();
        users.sort_unstable();
        users.dedup();

        users
            .into_iter()
            .map(|user| {
                let balance = summary
                    .balances
                    .iter()
                    .find(|(u, s, _)| *u == user && *s == self.market.scope)
                    .map(|(_, _, b)| *b)
                    .unwrap_or_else(|| ledger.balance(user, self.market.scope));
                let position = summary
                    .positions
                    .iter()
                    .find(|(u, m, _)| *u == user && *m == self.market.id)
                    .map(|(_, _, p)| *p)
                    .unwrap_or_else(|| ledger.position(user, self.market.id));
                PortfolioDelta {
                    user_id: user,
                    market_id: self.market.id,
                    balance_avail: balance.avail(),
                    balance_frozen: balance.frozen(),
                    yes_shares: position.yes.shares,
                    no_shares: position.no.shares,
                }
            })
            .collect()
    }

    fn publish_book_and_deltas(&self, deltas: Vec<PortfolioDelta>) {
        self.bus.publish(PushEvent::Market(MarketEvent::OrderbookUpdate {
            market_id: self.market.id,
            snapshot: self.snapshot(),
        }));
        for delta in deltas {
            self.bus.publish(PushEvent::Portfolio(delta));
        }
    }
}

trait TapPublish {
    fn tap_publish(self, engine: &MarketEngine, deltas: Vec<PortfolioDelta>) -> Self;
}

impl TapPublish for Report {
    fn tap_publish(self, engine: &MarketEngine, deltas: Vec<PortfolioDelta>) -> Self {
        engine.publish_book_and_deltas(deltas);
        self
    }
}

const STORE_RETRIES: usize = 3;

fn with_retry(mut op: impl FnMut() -> Result<(), StoreError>) -> Result<(), EngineError> {
    let mut last = None;
    for _ in 0..STORE_RETRIES {
        match op() {
            Ok(()) => return Ok(()),
            Err(err) => last = Some(err),
        }
    }
    if let Some(err) = last {
        tracing::error!(error = %err, "persistence failed after {STORE_RETRIES} attempts");
    }
    Err(EngineError::ServiceUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::MarketScope;
    use crate::store::MemoryStore;

    const G: MarketScope = MarketScope::Global;

    struct Fixture {
        engine: MarketEngine,
        ledger: Arc<Mutex<Ledger>>,
    }

    fn fixture() -> Fixture {
        let mut ledger = Ledger::new();
        for user in 1..=4 {
            ledger.deposit(user, G, 1_000).unwrap();
        }
        let ledger = Arc::new(Mutex::new(ledger));
        let market = Market::new(1, "m".into(), "d".into(), 1, G, 0, 0);
        let engine = MarketEngine::new(
            market,
            MarketBook::new(),
            Arc::clone(&ledger),
            Arc::new(MemoryStore::new()),
            ManualClock::new(1_000),
            EventBus::new(1024),
            IdGen::new(1, 1),
            10,
        );
        Fixture { engine, ledger }
    }

    fn limit(user: UserId, side: Side, kind: OrderKind, price: Cents, qty: u64) -> Command {
        Command::PlaceLimit {
            user,
            side,
            kind,
            price,
            quantity: qty,
        }
    }

    fn avail(f: &Fixture, user: UserId) -> Cents {
        f.ledger.lock().unwrap().balance(user, G).avail()
    }

    #[test]
    fn buy_rests_and_escrows() {
        let mut f = fixture();
        let report = f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 60, 10)).unwrap();
        let order = report.order.unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert!(report.trades.is_empty());
        assert_eq!(avail(&f, 1), 400);
        assert_eq!(f.ledger.lock().unwrap().balance(1, G).frozen(), 600);
    }

    #[test]
    fn opposite_buys_mint_exact_pair() {
        let mut f = fixture();
        f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 60, 10)).unwrap();
        let report = f.engine.handle(limit(2, Side::No, OrderKind::Buy, 40, 10)).unwrap();

        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.kind, TradeKind::Mint);
        assert_eq!(trade.side, Side::Yes);
        assert_eq!(trade.price, 60);
        assert_eq!(trade.quantity, 10);
        assert!(trade.seller_id.is_none());

        let ledger = f.ledger.lock().unwrap();
        assert_eq!(ledger.balance(1, G).total(), Some(400));
        assert_eq!(ledger.balance(2, G).total(), Some(600));
        assert_eq!(ledger.position(1, 1).yes.shares, 10);
        assert_eq!(ledger.position(2, 1).no.shares, 10);
        assert_eq!(ledger.share_totals(1), (10, 10));
    }

    #[test]
    fn mint_surplus_split_half_and_half() {
        let mut f = fixture();
        // YES 60 resting, NO 45 incoming: surplus 5 per unit.
        // Incoming (NO) gets floor(5/2)=2 back, resting (YES) gets 3.
        f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 60, 10)).unwrap();
        let report = f.engine.handle(limit(2, Side::No, OrderKind::Buy, 45, 10)).unwrap();

        assert_eq!(report.tokens_spent, 430); // 45 - 2 = 43 per share
        let ledger = f.ledger.lock().unwrap();
        // Resting YES pays 60 - 3 = 57 per share
        assert_eq!(ledger.balance(1, G).total(), Some(430));
        assert_eq!(ledger.balance(2, G).total(), Some(570));
        // Pair total per unit is exactly one token
        assert_eq!(ledger.position(1, 1).yes.cost + ledger.position(2, 1).no.cost, 1_000);
    }

    #[test]
    fn same_side_match_at_maker_price_with_refund() {
        let mut f = fixture();
        // Seed seller 3 with YES shares via a mint
        f.engine.handle(limit(3, Side::Yes, OrderKind::Buy, 60, 5)).unwrap();
        f.engine.handle(limit(4, Side::No, OrderKind::Buy, 40, 5)).unwrap();

        // Seller asks 60, buyer bids 70: fill at 60, refund 10/share
        f.engine.handle(limit(3, Side::Yes, OrderKind::Sell, 60, 5)).unwrap();
        let report = f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 70, 5)).unwrap();

        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].kind, TradeKind::Match);
        assert_eq!(report.trades[0].price, 60);
        assert_eq!(report.tokens_spent, 300);
        assert_eq!(report.tokens_refunded, 50);
        assert_eq!(avail(&f, 1), 700);

        let ledger = f.ledger.lock().unwrap();
        assert_eq!(ledger.position(1, 1).yes.shares, 5);
        assert_eq!(ledger.position(3, 1).yes.shares, 0);
        // Seller paid 300 at mint, received 300 from the sale
        assert_eq!(ledger.balance(3, G).avail(), 1_000);
    }

    #[test]
    fn match_preferred_over_mint_on_equal_cost() {
        let mut f = fixture();
        // Seed user 3 with YES shares
        f.engine.handle(limit(3, Side::Yes, OrderKind::Buy, 50, 5)).unwrap();
        f.engine.handle(limit(4, Side::No, OrderKind::Buy, 50, 5)).unwrap();
        // Ask at 60 and an opposite bid at 40 price an equal-cost fill
        // (match 60 vs mint 60 for a YES buy at 60)
        f.engine.handle(limit(3, Side::Yes, OrderKind::Sell, 60, 5)).unwrap();
        f.engine.handle(limit(4, Side::No, OrderKind::Buy, 40, 5)).unwrap();

        let report = f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 60, 5)).unwrap();
        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].kind, TradeKind::Match);
        // Share supply unchanged: still the 5 minted at the start
        assert_eq!(f.ledger.lock().unwrap().share_totals(1), (5, 5));
    }

    #[test]
    fn sell_requires_shares() {
        let mut f = fixture();
        let err = f.engine.handle(limit(1, Side::Yes, OrderKind::Sell, 50, 5)).unwrap_err();
        assert_eq!(err, EngineError::InsufficientShares);
    }

    #[test]
    fn buy_requires_balance() {
        let mut f = fixture();
        let err = f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 99, 11)).unwrap_err();
        assert_eq!(err, EngineError::InsufficientBalance);
        assert_eq!(avail(&f, 1), 1_000);
    }

    #[test]
    fn invalid_price_rejected() {
        let mut f = fixture();
        for price in [0, 100, 250] {
            let err = f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, price, 1)).unwrap_err();
            assert!(matches!(err, EngineError::InvalidOrder(_)));
        }
    }

    #[test]
    fn cancel_refunds_exactly() {
        let mut f = fixture();
        let report = f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 50, 10)).unwrap();
        let order_id = report.order.unwrap().id;
        assert_eq!(avail(&f, 1), 500);

        let report = f.engine.handle(Command::Cancel { order_id, user: 1 }).unwrap();
        assert_eq!(report.tokens_refunded, 500);
        assert_eq!(avail(&f, 1), 1_000);
        assert_eq!(report.order.unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn cancel_foreign_order_denied() {
        let mut f = fixture();
        let report = f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 50, 10)).unwrap();
        let order_id = report.order.unwrap().id;
        let err = f.engine.handle(Command::Cancel { order_id, user: 2 }).unwrap_err();
        assert_eq!(err, EngineError::NotAuthorized);
        let err = f.engine.handle(Command::Cancel { order_id: 999, user: 1 }).unwrap_err();
        assert_eq!(err, EngineError::NotFound);
    }

    #[test]
    fn self_trade_expires_own_maker() {
        let mut f = fixture();
        f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 60, 5)).unwrap();
        // Same user posts the opposite leg of a would-be mint: the
        // resting order is expired, the new one rests, no shares appear.
        let report = f.engine.handle(limit(1, Side::No, OrderKind::Buy, 40, 5)).unwrap();
        assert!(report.trades.is_empty());
        assert_eq!(report.order.unwrap().status, OrderStatus::Open);

        let ledger = f.ledger.lock().unwrap();
        assert_eq!(ledger.share_totals(1), (0, 0));
        // Only the new order's escrow remains frozen
        assert_eq!(ledger.balance(1, G).frozen(), 200);
        assert_eq!(ledger.balance(1, G).total(), Some(1_000));
    }

    #[test]
    fn commands_after_resolution_fail_closed() {
        let mut f = fixture();
        f.engine.handle(Command::Resolve { outcome: Outcome::Yes }).unwrap();
        let err = f.engine.handle(limit(1, Side::Yes, OrderKind::Buy, 50, 1)).unwrap_err();
        assert_eq!(err, EngineError::MarketClosed);
        let err = f.engine.handle(Command::Resolve { outcome: Outcome::No }).unwrap_err();
        assert_eq!(err, EngineError::MarketClosed);
    }

    #[test]
    fn market_buy_walks_books_and_refunds_leftover() {
        let mut f = fixture();
        // Build asks at 30x5 and 40x5 (via mints, then sells)
        f.engine.handle(limit(3, Side::Yes, OrderKind::Buy, 50, 10)).unwrap();
        f.engine.handle(limit(4, Side::No, OrderKind::Buy, 50, 10)).unwrap();
        f.engine.handle(limit(3, Side::Yes, OrderKind::Sell, 30, 5)).unwrap();
        f.engine.handle(limit(3, Side::Yes, OrderKind::Sell, 40, 5)).unwrap();

        let report = f
            .engine
            .handle(Command::PlaceMarket {
                user: 1,
                side: Side::Yes,
                spec: MarketOrderSpec::BuyBudget(300),
            })
            .unwrap();

        // 5 @ 30 = 150, then 3 @ 40 = 120; 30 cents short of a 4th
        assert_eq!(report.shares_filled, 8);
        assert_eq!(report.tokens_spent, 270);
        assert_eq!(report.tokens_refunded, 30);
        assert_eq!(report.avg_price_centicents(), Some(3375));
        assert_eq!(avail(&f, 1), 730);
    }

    #[test]
    fn market_sell_reports_unfilled_remainder() {
        let mut f = fixture();
        f.engine.handle(limit(3, Side::Yes, OrderKind::Buy, 50, 10)).unwrap();
        f.engine.handle(limit(4, Side::No, OrderKind::Buy, 50, 10)).unwrap();
        // One resting YES bid for 4 shares at 45c
        f.engine.handle(limit(2, Side::Yes, OrderKind::Buy, 45, 4)).unwrap();

        let report = f
            .engine
            .handle(Command::PlaceMarket {
                user: 3,
                side: Side::Yes,
                spec: MarketOrderSpec::SellQuantity(10),
            })
            .unwrap();

        assert_eq!(report.shares_filled, 4);
        assert_eq!(report.shares_released, 6);
        assert_eq!(report.tokens_received, 180);
        let ledger = f.ledger.lock().unwrap();
        assert_eq!(ledger.position(3, 1).yes.shares, 6);
        assert_eq!(ledger.position(3, 1).yes.reserved, 0);
    }
}
