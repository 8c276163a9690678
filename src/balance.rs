//! Enforced token balance type
//!
//! The single source of truth for token amounts. Fields are private so
//! every mutation goes through a checked method; each mutation bumps a
//! version counter for the audit trail.
//!
//! Invariant: `avail + frozen` is the user's total holding in this scope
//! and never goes negative. Escrow against open BUY orders lives in
//! `frozen`; everything spendable lives in `avail`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::Cents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("insufficient available funds")]
    InsufficientAvailable,
    #[error("insufficient frozen funds")]
    InsufficientFrozen,
    #[error("balance arithmetic overflow")]
    Overflow,
}

/// Token balance for one (user, scope) pair, in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    avail: Cents,
    frozen: Cents,
    version: u64,
}

impl Balance {
    #[inline(always)]
    pub const fn avail(&self) -> Cents {
        self.avail
    }

    #[inline(always)]
    pub const fn frozen(&self) -> Cents {
        self.frozen
    }

    /// Total holding (avail + frozen). None signals corruption.
    #[inline(always)]
    pub const fn total(&self) -> Option<Cents> {
        self.avail.checked_add(self.frozen)
    }

    #[inline(always)]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Add funds to the available pool.
    pub fn deposit(&mut self, amount: Cents) -> Result<(), BalanceError> {
        self.avail = self
            .avail
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Move funds from available to frozen (order escrow).
    pub fn lock(&mut self, amount: Cents) -> Result<(), BalanceError> {
        if self.avail < amount {
            return Err(BalanceError::InsufficientAvailable);
        }
        self.avail -= amount;
        self.frozen = self
            .frozen
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Move funds from frozen back to available (cancel / price refund).
    pub fn unlock(&mut self, amount: Cents) -> Result<(), BalanceError> {
        if self.frozen < amount {
            return Err(BalanceError::InsufficientFrozen);
        }
        self.frozen -= amount;
        self.avail = self
            .avail
            .checked_add(amount)
            .ok_or(BalanceError::Overflow)?;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Consume frozen funds without crediting available (settlement).
    pub fn spend_frozen(&mut self, amount: Cents) -> Result<(), BalanceError> {
        if self.frozen < amount {
            return Err(BalanceError::InsufficientFrozen);
        }
        self.frozen -= amount;
        self.version = self.version.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposit_and_lock() {
        let mut bal = Balance::default();
        bal.deposit(1_000).unwrap();
        assert_eq!(bal.avail(), 1_000);

        bal.lock(600).unwrap();
        assert_eq!(bal.avail(), 400);
        assert_eq!(bal.frozen(), 600);
        assert_eq!(bal.total(), Some(1_000));
    }

    #[test]
    fn lock_requires_available() {
        let mut bal = Balance::default();
        bal.deposit(100).unwrap();
        assert_eq!(bal.lock(101), Err(BalanceError::InsufficientAvailable));
        // Unchanged on failure
        assert_eq!(bal.avail(), 100);
        assert_eq!(bal.frozen(), 0);
    }

    #[test]
    fn unlock_round_trip() {
        let mut bal = Balance::default();
        bal.deposit(500).unwrap();
        bal.lock(500).unwrap();
        bal.unlock(200).unwrap();
        assert_eq!(bal.avail(), 200);
        assert_eq!(bal.frozen(), 300);
        assert_eq!(bal.unlock(301), Err(BalanceError::InsufficientFrozen));
    }

    #[test]
    fn spend_frozen_reduces_total() {
        let mut bal = Balance::default();
        bal.deposit(1_000).unwrap();
        bal.lock(600).unwrap();
        bal.spend_frozen(600).unwrap();
        assert_eq!(bal.avail(), 400);
        assert_eq!(bal.frozen(), 0);
        assert_eq!(bal.total(), Some(400));
    }

    #[test]
    fn deposit_overflow_is_explicit() {
        let mut bal = Balance::default();
        bal.deposit(u64::MAX).unwrap();
        assert_eq!(bal.deposit(1), Err(BalanceError::Overflow));
    }

    #[test]
    fn version_increments_on_every_mutation() {
        let mut bal = Balance::default();
        bal.deposit(100).unwrap();
        bal.lock(50).unwrap();
        bal.unlock(10).unwrap();
        bal.spend_frozen(40).unwrap();
        assert_eq!(bal.version(), 4);
    }
}
