//! Messages - engine command surface and results
//!
//! The gateway translates validated requests into [`Command`]s, enqueues
//! them on the owning market's channel, and receives a [`Report`] (or an
//! [`EngineError`]) back. Commands never carry authentication material;
//! the acting principal is resolved before a command is built.

use serde::Serialize;
use thiserror::Error;

use crate::core_types::{Cents, OrderId, UserId};
use crate::ledger::LedgerError;
use crate::models::{Order, OrderKind, Outcome, Side, Trade};

/// Sizing of a market order.
#[derive(Debug, Clone, Copy)]
pub enum MarketOrderSpec {
    /// BUY: spend up to this many cents; leftover is refunded.
    BuyBudget(Cents),
    /// SELL: dispose of up to this many shares; leftover is reported.
    SellQuantity(u64),
}

/// One unit of work for a market's serial actor.
#[derive(Debug, Clone)]
pub enum Command {
    PlaceLimit {
        user: UserId,
        side: Side,
        kind: OrderKind,
        price: Cents,
        quantity: u64,
    },
    PlaceMarket {
        user: UserId,
        side: Side,
        spec: MarketOrderSpec,
    },
    Cancel {
        order_id: OrderId,
        user: UserId,
    },
    /// Admin: declare the outcome and pay out winners.
    Resolve { outcome: Outcome },
    /// Admin: unwind the market, refunding escrow and cost bases.
    Delete,
}

/// Result of a committed command.
///
/// `tokens_spent` is what actually left the caller's balance;
/// `tokens_refunded` is escrow returned to them within the same command
/// (price improvement, leftover market-order budget, cancel refunds).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub order: Option<Order>,
    pub trades: Vec<Trade>,
    pub tokens_spent: Cents,
    pub tokens_refunded: Cents,
    /// Sale proceeds credited to the caller.
    pub tokens_received: Cents,
    pub shares_filled: u64,
    /// SELL shares returned unfilled (cancel or dry book).
    pub shares_released: u64,
}

impl Report {
    /// Average fill price in hundredths of a cent (3375 = 33.75c), or
    /// None when nothing filled. Integer so no drift leaves the engine.
    pub fn avg_price_centicents(&self) -> Option<u64> {
        if self.shares_filled == 0 {
            None
        } else {
            Some(self.tokens_spent * 100 / self.shares_filled)
        }
    }
}

/// Command failure. Whole-command semantics: any error means no side
/// effects were committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("insufficient token balance")]
    InsufficientBalance,
    #[error("insufficient shares")]
    InsufficientShares,
    #[error("market is not active")]
    MarketClosed,
    #[error("not found")]
    NotFound,
    #[error("not authorized")]
    NotAuthorized,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("command timed out before reaching the engine")]
    Timeout,
    #[error("market worker unavailable")]
    ServiceUnavailable,
    /// Invariant violation inside the engine; the market worker halts.
    #[error("fatal engine error: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Canonical wire code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidOrder(_) => "INVALID_ORDER",
            EngineError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            EngineError::InsufficientShares => "INSUFFICIENT_SHARES",
            EngineError::MarketClosed => "MARKET_CLOSED",
            EngineError::NotFound => "NOT_FOUND",
            EngineError::NotAuthorized => "NOT_AUTHORIZED",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::Timeout => "TIMEOUT",
            EngineError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            EngineError::Fatal(_) => "SERVICE_UNAVAILABLE",
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance => EngineError::InsufficientBalance,
            LedgerError::InsufficientShares => EngineError::InsufficientShares,
            LedgerError::Corruption(msg) => EngineError::Fatal(msg.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_price_is_exact_in_centicents() {
        let report = Report {
            tokens_spent: 270,
            shares_filled: 8,
            ..Default::default()
        };
        assert_eq!(report.avg_price_centicents(), Some(3375)); // 33.75c
    }

    #[test]
    fn avg_price_none_when_unfilled() {
        assert_eq!(Report::default().avg_price_centicents(), None);
    }

    #[test]
    fn ledger_errors_map_to_wire_codes() {
        assert_eq!(
            EngineError::from(LedgerError::InsufficientBalance).code(),
            "INSUFFICIENT_BALANCE"
        );
        assert_eq!(
            EngineError::from(LedgerError::InsufficientShares).code(),
            "INSUFFICIENT_SHARES"
        );
        assert!(matches!(
            EngineError::from(LedgerError::Corruption("x")),
            EngineError::Fatal(_)
        ));
    }
}
