//! Share positions
//!
//! One [`Position`] per (user, market): share counts per side, a reserve
//! counter for shares escrowed against open SELL orders, and an integer
//! cost basis per side. The cost basis is the total cents paid to acquire
//! the currently held shares; the volume-weighted average price is
//! `cost / shares` and is computed only at the display boundary. Sales
//! remove `cost * qty / shares` (floor) so the average is unchanged by
//! sales, and delete-market refunds are exact integers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::Cents;
use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("insufficient unreserved shares")]
    InsufficientShares,
    #[error("insufficient reserved shares")]
    InsufficientReserved,
    #[error("position arithmetic overflow")]
    Overflow,
}

/// Holdings on one side of a market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub shares: u64,
    /// Shares escrowed against open SELL orders. Always <= shares.
    pub reserved: u64,
    /// Total cents paid for the shares currently held.
    pub cost: Cents,
}

impl Holding {
    /// Shares not locked under a SELL order.
    #[inline]
    pub fn available(&self) -> u64 {
        self.shares - self.reserved
    }
}

/// A user's share position in one market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub yes: Holding,
    pub no: Holding,
}

impl Position {
    #[inline]
    pub fn side(&self, side: Side) -> &Holding {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }

    #[inline]
    fn side_mut(&mut self, side: Side) -> &mut Holding {
        match side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.yes.shares == 0 && self.no.shares == 0
    }

    /// Add shares acquired for `total_cost` cents (mint or purchase).
    pub fn acquire(&mut self, side: Side, qty: u64, total_cost: Cents) -> Result<(), PositionError> {
        let h = self.side_mut(side);
        h.shares = h.shares.checked_add(qty).ok_or(PositionError::Overflow)?;
        h.cost = h
            .cost
            .checked_add(total_cost)
            .ok_or(PositionError::Overflow)?;
        Ok(())
    }

    /// Escrow shares against a SELL order.
    pub fn reserve(&mut self, side: Side, qty: u64) -> Result<(), PositionError> {
        let h = self.side_mut(side);
        if h.available() < qty {
            return Err(PositionError::InsufficientShares);
        }
        h.reserved += qty;
        Ok(())
    }

    /// Return escrowed shares (SELL cancel or unfilled remainder).
    pub fn release(&mut self, side: Side, qty: u64) -> Result<(), PositionError> {
        let h = self.side_mut(side);
        if h.reserved < qty {
            return Err(PositionError::InsufficientReserved);
        }
        h.reserved -= qty;
        Ok(())
    }

    /// Remove `qty` reserved shares (a SELL fill). Returns the cost basis
    /// removed with them, keeping the average price of the remainder.
    pub fn take_reserved(&mut self, side: Side, qty: u64) -> Result<Cents, PositionError> {
        let h = self.side_mut(side);
        if h.reserved < qty {
            return Err(PositionError::InsufficientReserved);
        }
        let removed_cost = h.cost * qty / h.shares;
        h.reserved -= qty;
        h.shares -= qty;
        h.cost -= removed_cost;
        Ok(removed_cost)
    }

    /// Drop everything (resolution payout or market deletion). Returns the
    /// final holdings so the caller can settle them.
    pub fn clear(&mut self) -> (Holding, Holding) {
        let out = (self.yes, self.no);
        self.yes = Holding::default();
        self.no = Holding::default();
        out
    }
}
