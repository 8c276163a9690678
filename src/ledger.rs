//! Ledger - authoritative balances and share positions
//!
//! The ledger exclusively owns token balances (keyed by user and scope)
//! and share positions (keyed by user and market). All mutation goes
//! through a [`Transaction`]: operations are staged against copy-on-write
//! snapshots and validated as they are staged, so any error leaves the
//! ledger untouched. `commit` applies the whole batch and re-checks the
//! share-symmetry invariant for every touched market.
//!
//! Cross-market concurrency: a single ledger guards all scopes, so the
//! caller serialises access with one lock around begin..commit. This is
//! the "or equivalent" of per-user row locks - coarser, but trivially
//! deadlock free.

use rustc_hash::FxHashMap;
use std::collections::HashSet;
use thiserror::Error;

use crate::balance::{Balance, BalanceError};
use crate::core_types::{Cents, MarketId, UserId};
use crate::models::{MarketScope, Side};
use crate::position::{Holding, Position, PositionError};

pub type BalanceKey = (UserId, MarketScope);
pub type PositionKey = (UserId, MarketId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient token balance")]
    InsufficientBalance,
    #[error("insufficient shares")]
    InsufficientShares,
    /// An operation that must not fail failed: escrow accounting is out
    /// of step with order state. The market worker halts on this.
    #[error("ledger corruption: {0}")]
    Corruption(&'static str),
}

impl From<BalanceError> for LedgerError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::InsufficientAvailable => LedgerError::InsufficientBalance,
            BalanceError::InsufficientFrozen => LedgerError::Corruption("frozen underflow"),
            BalanceError::Overflow => LedgerError::Corruption("balance overflow"),
        }
    }
}

impl From<PositionError> for LedgerError {
    fn from(err: PositionError) -> Self {
        match err {
            PositionError::InsufficientShares => LedgerError::InsufficientShares,
            PositionError::InsufficientReserved => LedgerError::Corruption("reserve underflow"),
            PositionError::Overflow => LedgerError::Corruption("position overflow"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    balances: FxHashMap<BalanceKey, Balance>,
    positions: FxHashMap<PositionKey, Position>,
}

/// Entries written back by a committed transaction, in final state.
/// The engine forwards these to persistence and to portfolio events.
#[derive(Debug, Default, Clone)]
pub struct CommitSummary {
    pub balances: Vec<(UserId, MarketScope, Balance)>,
    pub positions: Vec<(UserId, MarketId, Position)>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// External grant (registration bonus, organization join).
    pub fn deposit(
        &mut self,
        user: UserId,
        scope: MarketScope,
        amount: Cents,
    ) -> Result<Balance, LedgerError> {
        let bal = self.balances.entry((user, scope)).or_default();
        bal.deposit(amount)?;
        Ok(*bal)
    }

    pub fn balance(&self, user: UserId, scope: MarketScope) -> Balance {
        self.balances.get(&(user, scope)).copied().unwrap_or_default()
    }

    pub fn position(&self, user: UserId, market: MarketId) -> Position {
        self.positions.get(&(user, market)).copied().unwrap_or_default()
    }

    pub fn positions_in_market(&self, market: MarketId) -> Vec<(UserId, Position)> {
        let mut out: Vec<_> = self
            .positions
            .iter()
            .filter(|((_, m), pos)| *m == market && !pos.is_empty())
            .map(|((u, _), pos)| (*u, *pos))
            .collect();
        // Deterministic settlement order (also the lock-ordering rule)
        out.sort_by_key(|(u, _)| *u);
        out
    }

    pub fn positions_for_user(&self, user: UserId) -> Vec<(MarketId, Position)> {
        let mut out: Vec<_> = self
            .positions
            .iter()
            .filter(|((u, _), pos)| *u == user && !pos.is_empty())
            .map(|((_, m), pos)| (*m, *pos))
            .collect();
        out.sort_by_key(|(m, _)| *m);
        out
    }

    /// (total YES shares, total NO shares) across all holders of a market.
    pub fn share_totals(&self, market: MarketId) -> (u64, u64) {
        self.positions
            .iter()
            .filter(|((_, m), _)| *m == market)
            .fold((0, 0), |(yes, no), (_, pos)| {
                (yes + pos.yes.shares, no + pos.no.shares)
            })
    }

    /// Recovery: install a persisted balance verbatim.
    pub fn restore_balance(&mut self, user: UserId, scope: MarketScope, balance: Balance) {
        self.balances.insert((user, scope), balance);
    }

    /// Recovery: install a persisted position verbatim.
    pub fn restore_position(&mut self, user: UserId, market: MarketId, position: Position) {
        self.positions.insert((user, market), position);
    }

    pub fn begin(&mut self) -> Transaction<'_> {
        Transaction {
            ledger: self,
            balances: FxHashMap::default(),
            positions: FxHashMap::default(),
            touched_markets: HashSet::new(),
        }
    }
}

/// A staged batch of balance and position mutations.
///
/// Dropping the transaction without `commit` is a rollback.
pub struct Transaction<'a> {
    ledger: &'a mut Ledger,
    balances: FxHashMap<BalanceKey, Balance>,
    positions: FxHashMap<PositionKey, Position>,
    touched_markets: HashSet<MarketId>,
}

impl Transaction<'_> {
    fn balance_mut(&mut self, user: UserId, scope: MarketScope) -> &mut Balance {
        self.balances
            .entry((user, scope))
            .or_insert_with(|| self.ledger.balance(user, scope))
    }

    fn position_mut(&mut self, user: UserId, market: MarketId) -> &mut Position {
        self.touched_markets.insert(market);
        self.positions
            .entry((user, market))
            .or_insert_with(|| self.ledger.position(user, market))
    }

    /// Staged view (for preference decisions mid-command).
    pub fn balance(&self, user: UserId, scope: MarketScope) -> Balance {
        self.balances
            .get(&(user, scope))
            .copied()
            .unwrap_or_else(|| self.ledger.balance(user, scope))
    }

    pub fn position(&self, user: UserId, market: MarketId) -> Position {
        self.positions
            .get(&(user, market))
            .copied()
            .unwrap_or_else(|| self.ledger.position(user, market))
    }

    /// Escrow tokens against an open BUY order (avail -> frozen).
    pub fn reserve_tokens(
        &mut self,
        user: UserId,
        scope: MarketScope,
        amount: Cents,
    ) -> Result<(), LedgerError> {
        Ok(self.balance_mut(user, scope).lock(amount)?)
    }

    /// Return escrow (frozen -> avail): cancel or maker-price refund.
    pub fn release_tokens(
        &mut self,
        user: UserId,
        scope: MarketScope,
        amount: Cents,
    ) -> Result<(), LedgerError> {
        Ok(self.balance_mut(user, scope).unlock(amount)?)
    }

    /// Consume escrow on settlement (frozen -> counterparty / mint pot).
    pub fn debit_tokens(
        &mut self,
        user: UserId,
        scope: MarketScope,
        amount: Cents,
    ) -> Result<(), LedgerError> {
        Ok(self.balance_mut(user, scope).spend_frozen(amount)?)
    }

    /// Credit spendable tokens (sale proceeds, resolution payout).
    pub fn credit_tokens(
        &mut self,
        user: UserId,
        scope: MarketScope,
        amount: Cents,
    ) -> Result<(), LedgerError> {
        Ok(self.balance_mut(user, scope).deposit(amount)?)
    }

    /// Escrow shares against an open SELL order.
    pub fn reserve_shares(
        &mut self,
        user: UserId,
        market: MarketId,
        side: Side,
        qty: u64,
    ) -> Result<(), LedgerError> {
        Ok(self.position_mut(user, market).reserve(side, qty)?)
    }

    /// Return share escrow (SELL cancel or unfilled remainder).
    pub fn release_shares(
        &mut self,
        user: UserId,
        market: MarketId,
        side: Side,
        qty: u64,
    ) -> Result<(), LedgerError> {
        Ok(self.position_mut(user, market).release(side, qty)?)
    }

    /// Create freshly minted shares at `unit_cost` cents per share.
    pub fn mint_shares(
        &mut self,
        user: UserId,
        market: MarketId,
        side: Side,
        qty: u64,
        unit_cost: Cents,
    ) -> Result<(), LedgerError> {
        Ok(self
            .position_mut(user, market)
            .acquire(side, qty, unit_cost * qty)?)
    }

    /// Move reserved shares from a seller to a buyer at `price` per share.
    pub fn transfer_shares(
        &mut self,
        from: UserId,
        to: UserId,
        market: MarketId,
        side: Side,
        qty: u64,
        price: Cents,
    ) -> Result<(), LedgerError> {
        self.position_mut(from, market).take_reserved(side, qty)?;
        self.position_mut(to, market).acquire(side, qty, price * qty)?;
        Ok(())
    }

    /// Wipe a position (resolution / deletion), returning the holdings
    /// that were destroyed so the caller can settle them.
    pub fn burn_position(
        &mut self,
        user: UserId,
        market: MarketId,
    ) -> Result<(Holding, Holding), LedgerError> {
        Ok(self.position_mut(user, market).clear())
    }

    /// Apply the whole batch. Verifies share symmetry for every market a
    /// position op touched before anything is written back.
    pub fn commit(self) -> Result<CommitSummary, LedgerError> {
        for market in &self.touched_markets {
            let (yes, no) = self.staged_share_totals(*market);
            if yes != no {
                return Err(LedgerError::Corruption("share symmetry violated"));
            }
        }

        let mut summary = CommitSummary::default();
        for ((user, scope), balance) in self.balances {
            tracing::trace!(user, ?scope, avail = balance.avail(), frozen = balance.frozen(), "balance commit");
            self.ledger.balances.insert((user, scope), balance);
            summary.balances.push((user, scope, balance));
        }
        for ((user, market), position) in self.positions {
            self.ledger.positions.insert((user, market), position);
            summary.positions.push((user, market, position));
        }
        Ok(summary)
    }

    /// Drop all staged work.
    pub fn rollback(self) {}

    fn staged_share_totals(&self, market: MarketId) -> (u64, u64) {
        let mut yes = 0u64;
        let mut no = 0u64;
        // Committed rows not shadowed by a staged copy...
        for ((user, m), pos) in &self.ledger.positions {
            if *m == market && !self.positions.contains_key(&(*user, *m)) {
                yes += pos.yes.shares;
                no += pos.no.shares;
            }
        }
        // ...plus the staged copies.
        for ((_, m), pos) in &self.positions {
            if *m == market {
                yes += pos.yes.shares;
                no += pos.no.shares;
            }
        }
        (yes, no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: MarketScope = MarketScope::Global;

    fn funded_ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.deposit(1, G, 1_000).unwrap();
        ledger.deposit(2, G, 1_000).unwrap();
        ledger
    }

    #[test]
    fn rollback_discards_staged_ops() {
        let mut ledger = funded_ledger();
        let mut txn = ledger.begin();
        txn.reserve_tokens(1, G, 600).unwrap();
        txn.rollback();
        assert_eq!(ledger.balance(1, G).avail(), 1_000);
        assert_eq!(ledger.balance(1, G).frozen(), 0);
    }

    #[test]
    fn failed_op_leaves_ledger_untouched() {
        let mut ledger = funded_ledger();
        let mut txn = ledger.begin();
        txn.reserve_tokens(1, G, 400).unwrap();
        assert_eq!(txn.reserve_tokens(1, G, 700), Err(LedgerError::InsufficientBalance));
        drop(txn);
        assert_eq!(ledger.balance(1, G).frozen(), 0);
    }

    #[test]
    fn mint_keeps_share_symmetry() {
        let mut ledger = funded_ledger();
        let mut txn = ledger.begin();
        txn.reserve_tokens(1, G, 600).unwrap();
        txn.reserve_tokens(2, G, 400).unwrap();
        txn.debit_tokens(1, G, 600).unwrap();
        txn.debit_tokens(2, G, 400).unwrap();
        txn.mint_shares(1, 10, Side::Yes, 10, 60).unwrap();
        txn.mint_shares(2, 10, Side::No, 10, 40).unwrap();
        txn.commit().unwrap();

        assert_eq!(ledger.share_totals(10), (10, 10));
        assert_eq!(ledger.balance(1, G).total(), Some(400));
        assert_eq!(ledger.balance(2, G).total(), Some(600));
    }

    #[test]
    fn asymmetric_commit_is_rejected() {
        let mut ledger = funded_ledger();
        let mut txn = ledger.begin();
        txn.mint_shares(1, 10, Side::Yes, 5, 60).unwrap();
        assert!(matches!(txn.commit(), Err(LedgerError::Corruption(_))));
        assert_eq!(ledger.share_totals(10), (0, 0));
    }

    #[test]
    fn transfer_moves_reserved_shares() {
        let mut ledger = funded_ledger();
        // Seed holder 1 with a symmetric book: 1 holds YES, 2 holds NO.
        let mut txn = ledger.begin();
        txn.mint_shares(1, 7, Side::Yes, 10, 60).unwrap();
        txn.mint_shares(2, 7, Side::No, 10, 40).unwrap();
        txn.commit().unwrap();

        let mut txn = ledger.begin();
        txn.reserve_shares(1, 7, Side::Yes, 4).unwrap();
        txn.transfer_shares(1, 2, 7, Side::Yes, 4, 55).unwrap();
        txn.commit().unwrap();

        assert_eq!(ledger.position(1, 7).yes.shares, 6);
        assert_eq!(ledger.position(2, 7).yes.shares, 4);
        assert_eq!(ledger.position(2, 7).yes.cost, 220);
        assert_eq!(ledger.share_totals(7), (10, 10));
    }

    #[test]
    fn scoped_balances_are_independent() {
        let mut ledger = Ledger::new();
        ledger.deposit(1, G, 500).unwrap();
        ledger.deposit(1, MarketScope::Org(3), 200).unwrap();

        let mut txn = ledger.begin();
        txn.reserve_tokens(1, MarketScope::Org(3), 200).unwrap();
        txn.commit().unwrap();

        assert_eq!(ledger.balance(1, G).avail(), 500);
        assert_eq!(ledger.balance(1, MarketScope::Org(3)).frozen(), 200);
    }
}
