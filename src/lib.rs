//! predex - play-money binary-outcome prediction market exchange
//!
//! Participants trade YES and NO shares that pay one token on the
//! winning side. The core is a per-market matching engine combining a
//! price-time limit orderbook with a share-minting rule: a YES-buy and a
//! NO-buy whose prices cover one token jointly fund a brand new share
//! pair. All accounting is integer cents, conserved except through
//! minting and resolution payout.
//!
//! # Modules
//!
//! - [`core_types`] - Id and amount type aliases
//! - [`config`] - YAML configuration with env overrides
//! - [`models`] - Market, order and trade types
//! - [`balance`] - Enforced token balance (avail/frozen)
//! - [`position`] - Share holdings with integer cost basis
//! - [`ledger`] - Authoritative accounts, staged transactions
//! - [`orderbook`] - BTreeMap price-time books per side
//! - [`engine`] - The matching engine (match + mint)
//! - [`resolver`] - Resolution payouts and deletion refunds
//! - [`bus`] - Typed pub/sub event bus
//! - [`store`] - Persistence capability + in-memory store
//! - [`clock`] - Clock capability
//! - [`worker`] - Per-market serial actors and registry
//! - [`accounts`] - User directory
//! - [`auth`] - JWT issuing and middleware
//! - [`gateway`] - HTTP surface (axum)
//! - [`websocket`] - Realtime push

pub mod core_types;

pub mod config;
pub mod logging;

pub mod balance;
pub mod bus;
pub mod clock;
pub mod engine;
pub mod ledger;
pub mod messages;
pub mod models;
pub mod orderbook;
pub mod position;
pub mod resolver;
pub mod store;
pub mod worker;

pub mod accounts;
pub mod auth;
pub mod gateway;
pub mod websocket;

// Convenient re-exports at crate root
pub use balance::Balance;
pub use config::AppConfig;
pub use core_types::{Cents, MarketId, OrderId, TradeId, UserId};
pub use engine::MarketEngine;
pub use ledger::Ledger;
pub use messages::{Command, EngineError, Report};
pub use models::{Market, Order, OrderKind, OrderStatus, Outcome, Side, Trade, TradeKind};
pub use orderbook::{MarketBook, SideBook};
pub use position::Position;
