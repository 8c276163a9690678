//! Core types used throughout the system
//!
//! Fundamental type aliases shared by all modules. They carry semantic
//! meaning and leave room for future type evolution.

/// User ID - globally unique, immutable after assignment.
pub type UserId = u64;

/// Market ID - one binary-outcome market per id.
pub type MarketId = u64;

/// Organization ID - scope key for organization-local token balances.
pub type OrgId = u64;

/// Order ID - unique within the system.
pub type OrderId = u64;

/// Trade ID - unique within the system.
pub type TradeId = u64;

/// Monetary amount in integer cents.
///
/// All engine arithmetic runs on cents. One token = 100 cents; a share
/// pays [`TOKEN_CENTS`] on the winning side at resolution. Floats appear
/// only at the display boundary.
pub type Cents = u64;

/// Value of one token, in cents. Also the payout of one winning share.
pub const TOKEN_CENTS: Cents = 100;

/// Lowest valid limit price, in cents.
pub const MIN_PRICE: Cents = 1;

/// Highest valid limit price, in cents.
pub const MAX_PRICE: Cents = 99;
