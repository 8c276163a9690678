// models.rs - Market, order and trade types

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core_types::{Cents, MarketId, OrderId, OrgId, TradeId, UserId};

/// Outcome side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    /// The opposing side (YES <-> NO).
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }
}

/// Order action: acquire shares or dispose of held shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Buy,
    Sell,
}

/// Order status - terminal states for a persisted order.
///
/// Once persisted an order MUST reach one of these states; it never
/// disappears or becomes unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Resting, nothing filled yet
    Open,
    /// Some quantity filled, remainder resting
    Partial,
    /// Fully filled
    Filled,
    /// Cancelled by the user or by market resolution/deletion
    Cancelled,
}

/// A limit order. Prices are integer cents in 1..=99.
///
/// BUY orders escrow `price * quantity` cents at placement; SELL orders
/// reserve `quantity` shares. The matching engine is the only mutator
/// after placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub market_id: MarketId,
    pub user_id: UserId,
    pub side: Side,
    pub kind: OrderKind,
    pub price: Cents,
    pub quantity: u64,
    pub filled: u64,
    pub status: OrderStatus,
    pub created_at_ms: u64,
}

impl Order {
    pub fn new(
        id: OrderId,
        market_id: MarketId,
        user_id: UserId,
        side: Side,
        kind: OrderKind,
        price: Cents,
        quantity: u64,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id,
            market_id,
            user_id,
            side,
            kind,
            price,
            quantity,
            filled: 0,
            status: OrderStatus::Open,
            created_at_ms,
        }
    }

    /// Quantity still unfilled.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.quantity - self.filled
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.filled >= self.quantity
    }

    /// Escrow still held against the unfilled remainder of a BUY.
    #[inline]
    pub fn remaining_escrow(&self) -> Cents {
        self.price * self.remaining()
    }

    /// Recompute status from fill progress (does not touch Cancelled).
    pub fn refresh_status(&mut self) {
        if self.status == OrderStatus::Cancelled {
            return;
        }
        self.status = if self.is_filled() {
            OrderStatus::Filled
        } else if self.filled > 0 {
            OrderStatus::Partial
        } else {
            OrderStatus::Open
        };
    }
}

/// How a trade came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeKind {
    /// Shares changed owners between a buyer and a seller.
    Match,
    /// A YES-buy and a NO-buy jointly funded a brand new share pair.
    Mint,
}

/// An executed trade. Append-only.
///
/// For MINT trades both parties are buyers: `buyer_id` is the YES-leg
/// buyer, `seller_id`/`seller_order_id` are None, and `price` is the
/// YES leg's effective per-share cost (surplus refund already applied),
/// so the pair's NO cost is always `100 - price`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub market_id: MarketId,
    pub kind: TradeKind,
    pub side: Side,
    pub price: Cents,
    pub quantity: u64,
    pub buyer_id: UserId,
    pub seller_id: Option<UserId>,
    pub buyer_order_id: OrderId,
    pub seller_order_id: Option<OrderId>,
    pub executed_at_ms: u64,
}

/// Resolved outcome of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn winning_side(self) -> Side {
        match self {
            Outcome::Yes => Side::Yes,
            Outcome::No => Side::No,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Resolved,
    Deleted,
}

/// Which balance pool a market trades against.
///
/// Global markets debit the user's global balance; organization markets
/// debit the member's balance inside that organization. Positions are
/// always keyed by the market itself, never by scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", content = "org_id", rename_all = "lowercase")]
pub enum MarketScope {
    Global,
    Org(OrgId),
}

/// A binary-outcome market.
///
/// `yes_price` / `no_price` are display midpoints maintained after every
/// book change; `volume` accumulates `price * qty` per MATCH and
/// `100 * qty` per MINT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub title: String,
    pub description: String,
    pub created_by: UserId,
    pub created_at_ms: u64,
    pub resolve_at_ms: u64,
    pub status: MarketStatus,
    pub outcome: Option<Outcome>,
    pub scope: MarketScope,
    pub volume: Cents,
    pub yes_price: Cents,
    pub no_price: Cents,
}

impl Market {
    pub fn new(
        id: MarketId,
        title: String,
        description: String,
        created_by: UserId,
        scope: MarketScope,
        created_at_ms: u64,
        resolve_at_ms: u64,
    ) -> Self {
        Self {
            id,
            title,
            description,
            created_by,
            created_at_ms,
            resolve_at_ms,
            status: MarketStatus::Active,
            outcome: None,
            scope,
            volume: 0,
            yes_price: 50,
            no_price: 50,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == MarketStatus::Active
    }
}
