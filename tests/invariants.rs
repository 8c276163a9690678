//! Conservation and priority invariants under adversarial sequences.
//!
//! The key accounting identity: at any instant,
//!     sum of all balances (avail + frozen)
//!   + 100 cents x outstanding YES shares
//! is constant, because every YES share has a NO twin and the pair was
//! funded with exactly one token at mint. Resolution pays the winning
//! side one token per share and discards the losers, closing the loop.

use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use predex::bus::EventBus;
use predex::clock::ManualClock;
use predex::engine::{IdGen, MarketEngine};
use predex::ledger::Ledger;
use predex::messages::{Command, EngineError, MarketOrderSpec};
use predex::models::{Market, MarketScope, OrderKind, Outcome, Side};
use predex::orderbook::MarketBook;
use predex::store::MemoryStore;

const G: MarketScope = MarketScope::Global;
const MARKET: u64 = 1;
const USERS: std::ops::RangeInclusive<u64> = 1..=6;
const FUNDING: u64 = 1_000_000;

struct Harness {
    engine: MarketEngine,
    ledger: Arc<Mutex<Ledger>>,
}

impl Harness {
    fn new() -> Self {
        let mut ledger = Ledger::new();
        for user in USERS {
            ledger.deposit(user, G, FUNDING).unwrap();
        }
        let ledger = Arc::new(Mutex::new(ledger));
        let market = Market::new(MARKET, "storm".into(), "".into(), 1, G, 0, 0);
        let engine = MarketEngine::new(
            market,
            MarketBook::new(),
            Arc::clone(&ledger),
            Arc::new(MemoryStore::new()),
            ManualClock::new(0),
            EventBus::new(65_536),
            IdGen::new(1, 1),
            10,
        );
        Self { engine, ledger }
    }

    fn total_balances(&self) -> u64 {
        let ledger = self.ledger.lock().unwrap();
        USERS.map(|u| ledger.balance(u, G).total().unwrap()).sum()
    }

    fn share_totals(&self) -> (u64, u64) {
        self.ledger.lock().unwrap().share_totals(MARKET)
    }

    /// The conserved quantity.
    fn conserved(&self) -> u64 {
        let (yes, no) = self.share_totals();
        assert_eq!(yes, no, "share symmetry broken");
        self.total_balances() + 100 * yes
    }
}

#[test]
fn conservation_without_minting() {
    let mut h = Harness::new();
    let initial = h.conserved();

    // Same-side traffic only: YES bids and (after a seed mint) YES asks
    // would mint, so restrict to bids and cancels - no trade can mint.
    let mut order_ids = Vec::new();
    for i in 0..20 {
        let report = h
            .engine
            .handle(Command::PlaceLimit {
                user: 1 + (i % 3),
                side: Side::Yes,
                kind: OrderKind::Buy,
                price: 30 + i,
                quantity: 5,
            })
            .unwrap();
        order_ids.push(report.order.unwrap().id);
    }
    assert_eq!(h.conserved(), initial);

    for order_id in order_ids.iter().step_by(2) {
        // Owner is (id-1) % 3 + 1 by construction
        let owner = 1 + ((order_id - 1) % 3);
        h.engine
            .handle(Command::Cancel {
                order_id: *order_id,
                user: owner,
            })
            .unwrap();
    }
    assert_eq!(h.conserved(), initial);
    assert_eq!(h.share_totals(), (0, 0));
}

#[test]
fn random_storm_preserves_accounting_identity() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut h = Harness::new();
    let initial = h.conserved();
    let mut open_orders: Vec<(u64, u64)> = Vec::new(); // (order_id, user)

    for step in 0..600 {
        let user = rng.gen_range(1..=6);
        let roll: f64 = rng.gen();
        let result = if roll < 0.55 {
            let side = if rng.gen() { Side::Yes } else { Side::No };
            let kind = if rng.gen_range(0..3) == 0 {
                OrderKind::Sell
            } else {
                OrderKind::Buy
            };
            h.engine.handle(Command::PlaceLimit {
                user,
                side,
                kind,
                price: rng.gen_range(1..=99),
                quantity: rng.gen_range(1..=20),
            })
        } else if roll < 0.70 && !open_orders.is_empty() {
            let (order_id, owner) = open_orders[rng.gen_range(0..open_orders.len())];
            h.engine.handle(Command::Cancel {
                order_id,
                user: owner,
            })
        } else if roll < 0.85 {
            let side = if rng.gen() { Side::Yes } else { Side::No };
            let spec = if rng.gen() {
                MarketOrderSpec::BuyBudget(rng.gen_range(1..=2_000))
            } else {
                MarketOrderSpec::SellQuantity(rng.gen_range(1..=10))
            };
            h.engine.handle(Command::PlaceMarket { user, side, spec })
        } else {
            continue;
        };

        match result {
            Ok(report) => {
                if let Some(order) = report.order {
                    if matches!(
                        order.status,
                        predex::OrderStatus::Open | predex::OrderStatus::Partial
                    ) {
                        open_orders.push((order.id, order.user_id));
                    }
                }
            }
            Err(EngineError::Fatal(msg)) => panic!("fatal engine error at step {step}: {msg}"),
            // Rejections (insufficient funds/shares, stale cancels) are
            // expected storm noise
            Err(_) => {}
        }

        assert_eq!(h.conserved(), initial, "conservation broken at step {step}");
    }

    // Full lifecycle: resolution converts every outstanding pair back
    // into tokens, restoring the exact initial total.
    h.engine
        .handle(Command::Resolve {
            outcome: if rng.gen() { Outcome::Yes } else { Outcome::No },
        })
        .unwrap();
    assert_eq!(h.share_totals(), (0, 0));
    assert_eq!(h.total_balances(), initial);
}

#[test]
fn matched_trade_no_loss_for_the_taker_buyer() {
    let mut h = Harness::new();
    // Mint inventory for user 5, then have them quote an ask at 35
    h.engine
        .handle(Command::PlaceLimit {
            user: 5,
            side: Side::Yes,
            kind: OrderKind::Buy,
            price: 50,
            quantity: 10,
        })
        .unwrap();
    h.engine
        .handle(Command::PlaceLimit {
            user: 6,
            side: Side::No,
            kind: OrderKind::Buy,
            price: 50,
            quantity: 10,
        })
        .unwrap();
    h.engine
        .handle(Command::PlaceLimit {
            user: 5,
            side: Side::Yes,
            kind: OrderKind::Sell,
            price: 35,
            quantity: 10,
        })
        .unwrap();

    let before = h.ledger.lock().unwrap().balance(1, G).total().unwrap();
    let report = h
        .engine
        .handle(Command::PlaceLimit {
            user: 1,
            side: Side::Yes,
            kind: OrderKind::Buy,
            price: 60,
            quantity: 10,
        })
        .unwrap();

    // Taker pays the resting 35, not their own 60
    assert_eq!(report.tokens_spent, 350);
    assert_eq!(report.tokens_refunded, 250);
    let after = h.ledger.lock().unwrap().balance(1, G).total().unwrap();
    assert_eq!(before - after, 350);
}

#[test]
fn mint_pair_always_costs_exactly_one_token_per_unit() {
    for (resting_yes, incoming_no) in [(60, 40), (60, 45), (99, 1), (51, 53), (70, 31)] {
        if resting_yes + incoming_no < 100 {
            continue;
        }
        let mut h = Harness::new();
        let before = h.total_balances();
        h.engine
            .handle(Command::PlaceLimit {
                user: 1,
                side: Side::Yes,
                kind: OrderKind::Buy,
                price: resting_yes,
                quantity: 7,
            })
            .unwrap();
        let report = h
            .engine
            .handle(Command::PlaceLimit {
                user: 2,
                side: Side::No,
                kind: OrderKind::Buy,
                price: incoming_no,
                quantity: 7,
            })
            .unwrap();
        assert_eq!(report.trades.len(), 1);

        let after = h.total_balances();
        assert_eq!(
            before - after,
            700,
            "pair at ({resting_yes},{incoming_no}) did not cost exactly 100c/unit"
        );
    }
}

#[test]
fn cancel_refund_is_exact_for_both_kinds() {
    let mut h = Harness::new();
    // BUY: 40c x 9 escrowed, partially filled by 4, cancel refunds 40 x 5
    h.engine
        .handle(Command::PlaceLimit {
            user: 1,
            side: Side::Yes,
            kind: OrderKind::Buy,
            price: 40,
            quantity: 9,
        })
        .unwrap();
    h.engine
        .handle(Command::PlaceLimit {
            user: 2,
            side: Side::No,
            kind: OrderKind::Buy,
            price: 60,
            quantity: 4,
        })
        .unwrap();

    let before = h.ledger.lock().unwrap().balance(1, G).avail();
    let report = h
        .engine
        .handle(Command::Cancel {
            order_id: 1,
            user: 1,
        })
        .unwrap();
    assert_eq!(report.tokens_refunded, 200);
    let after = h.ledger.lock().unwrap().balance(1, G).avail();
    assert_eq!(after - before, 200);

    // SELL: reserve 4 shares, cancel releases them
    let report = h
        .engine
        .handle(Command::PlaceLimit {
            user: 1,
            side: Side::Yes,
            kind: OrderKind::Sell,
            price: 90,
            quantity: 4,
        })
        .unwrap();
    let sell_id = report.order.unwrap().id;
    {
        let ledger = h.ledger.lock().unwrap();
        assert_eq!(ledger.position(1, MARKET).yes.reserved, 4);
    }
    let report = h
        .engine
        .handle(Command::Cancel {
            order_id: sell_id,
            user: 1,
        })
        .unwrap();
    assert_eq!(report.shares_released, 4);
    let ledger = h.ledger.lock().unwrap();
    assert_eq!(ledger.position(1, MARKET).yes.reserved, 0);
    assert_eq!(ledger.position(1, MARKET).yes.shares, 4);
}

#[test]
fn resolution_payout_equals_winning_shares() {
    let mut h = Harness::new();
    h.engine
        .handle(Command::PlaceLimit {
            user: 1,
            side: Side::Yes,
            kind: OrderKind::Buy,
            price: 55,
            quantity: 12,
        })
        .unwrap();
    h.engine
        .handle(Command::PlaceLimit {
            user: 2,
            side: Side::No,
            kind: OrderKind::Buy,
            price: 45,
            quantity: 12,
        })
        .unwrap();

    let pre = h.ledger.lock().unwrap().balance(1, G).total().unwrap();
    let yes_shares = h.ledger.lock().unwrap().position(1, MARKET).yes.shares;
    h.engine
        .handle(Command::Resolve {
            outcome: Outcome::Yes,
        })
        .unwrap();
    let post = h.ledger.lock().unwrap().balance(1, G).total().unwrap();
    assert_eq!(post - pre, yes_shares * 100);
}
