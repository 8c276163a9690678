//! Resolver - terminal settlement of a market
//!
//! Resolution cancels every resting order (escrow back, reserved shares
//! back), credits winning positions at one token per share and destroys
//! all share positions. Deletion is the admin error-correction path: the
//! same cancel pass, then every holder gets their remaining cost basis
//! back instead of a payout.

use crate::core_types::{Cents, UserId, TOKEN_CENTS};
use crate::ledger::{LedgerError, Transaction};
use crate::models::{Market, Order, OrderKind, OrderStatus, Outcome, Side};
use crate::orderbook::MarketBook;
use crate::position::Position;

/// Cancel every resting order with a full refund of the unfilled
/// remainder. Returns the cancelled orders for persistence.
pub fn cancel_all_open(
    book: &mut MarketBook,
    txn: &mut Transaction<'_>,
    market: &Market,
) -> Result<Vec<Order>, LedgerError> {
    let mut orders = book.drain_all();
    for order in &mut orders {
        match order.kind {
            OrderKind::Buy => {
                txn.release_tokens(order.user_id, market.scope, order.remaining_escrow())?
            }
            OrderKind::Sell => {
                txn.release_shares(order.user_id, market.id, order.side, order.remaining())?
            }
        }
        order.status = OrderStatus::Cancelled;
        tracing::debug!(order_id = order.id, user = order.user_id, "order cancelled by settlement");
    }
    Ok(orders)
}

/// Pay 100c per winning share, then burn all positions. Losing shares
/// are simply discarded; their token value is zero, so discarding both
/// sides equally keeps the conservation ledger closed.
pub fn payout_resolution(
    txn: &mut Transaction<'_>,
    holders: &[(UserId, Position)],
    market: &Market,
    outcome: Outcome,
) -> Result<Cents, LedgerError> {
    let winning = outcome.winning_side();
    let mut total_paid = 0;
    for (user, _) in holders {
        let (yes, no) = txn.burn_position(*user, market.id)?;
        let won = match winning {
            Side::Yes => yes.shares,
            Side::No => no.shares,
        };
        if won > 0 {
            let payout = won * TOKEN_CENTS;
            txn.credit_tokens(*user, market.scope, payout)?;
            total_paid += payout;
            tracing::debug!(user, shares = won, payout, "resolution payout");
        }
    }
    Ok(total_paid)
}

/// Refund every holder the cents they paid for their current position.
pub fn refund_deletion(
    txn: &mut Transaction<'_>,
    holders: &[(UserId, Position)],
    market: &Market,
) -> Result<Cents, LedgerError> {
    let mut total_refunded = 0;
    for (user, _) in holders {
        let (yes, no) = txn.burn_position(*user, market.id)?;
        let refund = yes.cost + no.cost;
        if refund > 0 {
            txn.credit_tokens(*user, market.scope, refund)?;
            total_refunded += refund;
            tracing::debug!(user, refund, "deletion refund");
        }
    }
    Ok(total_refunded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::models::MarketScope;

    fn market() -> Market {
        Market::new(1, "t".into(), "d".into(), 1, MarketScope::Global, 0, 0)
    }

    /// Mint 10 shares: user 1 holds YES at 60c, user 2 holds NO at 40c.
    fn seeded_ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.deposit(1, MarketScope::Global, 1_000).unwrap();
        ledger.deposit(2, MarketScope::Global, 1_000).unwrap();
        let mut txn = ledger.begin();
        txn.reserve_tokens(1, MarketScope::Global, 600).unwrap();
        txn.debit_tokens(1, MarketScope::Global, 600).unwrap();
        txn.reserve_tokens(2, MarketScope::Global, 400).unwrap();
        txn.debit_tokens(2, MarketScope::Global, 400).unwrap();
        txn.mint_shares(1, 1, Side::Yes, 10, 60).unwrap();
        txn.mint_shares(2, 1, Side::No, 10, 40).unwrap();
        txn.commit().unwrap();
        ledger
    }

    #[test]
    fn resolution_pays_winning_side_only() {
        let mut ledger = seeded_ledger();
        let m = market();
        let holders = ledger.positions_in_market(1);
        let mut txn = ledger.begin();
        let paid = payout_resolution(&mut txn, &holders, &m, Outcome::Yes).unwrap();
        txn.commit().unwrap();

        assert_eq!(paid, 1_000);
        assert_eq!(ledger.balance(1, MarketScope::Global).avail(), 1_400);
        assert_eq!(ledger.balance(2, MarketScope::Global).avail(), 600);
        assert_eq!(ledger.share_totals(1), (0, 0));
    }

    #[test]
    fn deletion_refunds_cost_basis() {
        let mut ledger = seeded_ledger();
        let m = market();
        let holders = ledger.positions_in_market(1);
        let mut txn = ledger.begin();
        let refunded = refund_deletion(&mut txn, &holders, &m).unwrap();
        txn.commit().unwrap();

        assert_eq!(refunded, 1_000);
        // Both users are made whole at what they paid in
        assert_eq!(ledger.balance(1, MarketScope::Global).avail(), 1_000);
        assert_eq!(ledger.balance(2, MarketScope::Global).avail(), 1_000);
        assert_eq!(ledger.share_totals(1), (0, 0));
    }

    #[test]
    fn cancel_all_refunds_escrow() {
        let mut ledger = seeded_ledger();
        let m = market();
        let mut book = MarketBook::new();

        let mut txn = ledger.begin();
        txn.reserve_tokens(2, MarketScope::Global, 150).unwrap();
        txn.commit().unwrap();
        book.side_mut(Side::Yes).rest(Order::new(
            7,
            1,
            2,
            Side::Yes,
            OrderKind::Buy,
            50,
            3,
            10,
        ));

        let mut txn = ledger.begin();
        let cancelled = cancel_all_open(&mut book, &mut txn, &m).unwrap();
        txn.commit().unwrap();

        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].status, OrderStatus::Cancelled);
        assert_eq!(ledger.balance(2, MarketScope::Global).frozen(), 0);
        assert_eq!(ledger.balance(2, MarketScope::Global).avail(), 600);
        assert!(book.iter().next().is_none());
    }
}
