//! API response envelope, error mapping and request/response DTOs
//!
//! All responses follow `{ code, msg, data }`: code 0 is success, any
//! other value is an error code from [`error_codes`]. Engine errors map
//! to HTTP status + code + a message prefixed with the canonical wire
//! name (`INSUFFICIENT_BALANCE: ...`). Amounts cross this boundary as
//! `rust_decimal` token values; the engine itself never leaves integer
//! cents.

use axum::{http::StatusCode, response::IntoResponse, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::core_types::{Cents, MarketId, OrderId, TradeId, UserId};
use crate::messages::{EngineError, Report};
use crate::models::{
    Market, MarketScope, MarketStatus, Order, OrderKind, OrderStatus, Outcome, Side, Trade,
    TradeKind,
};
use crate::orderbook::{BookSnapshot, SideLevels};

// ============================================================
// Envelope
// ============================================================

/// Unified API response wrapper.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    /// 0 for success, non-zero error code otherwise
    #[schema(example = 0)]
    pub code: i32,
    #[schema(example = "ok")]
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }
}

/// Handler return type alias.
pub type ApiResult<T> =
    Result<(StatusCode, Json<ApiResponse<T>>), (StatusCode, Json<ApiResponse<()>>)>;

#[inline]
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

pub mod error_codes {
    pub const INVALID_PARAMETER: i32 = 1000;
    pub const INVALID_ORDER: i32 = 1001;
    pub const INSUFFICIENT_BALANCE: i32 = 1002;
    pub const INSUFFICIENT_SHARES: i32 = 1003;
    pub const MARKET_CLOSED: i32 = 1004;
    pub const AUTH_FAILED: i32 = 1401;
    pub const NOT_AUTHORIZED: i32 = 1403;
    pub const NOT_FOUND: i32 = 1404;
    pub const TIMEOUT: i32 = 1408;
    pub const CONFLICT: i32 = 1409;
    pub const INTERNAL_ERROR: i32 = 1500;
    pub const SERVICE_UNAVAILABLE: i32 = 1503;
}

/// Unified API error with automatic IntoResponse.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, error_codes::AUTH_FAILED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, error_codes::NOT_AUTHORIZED, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            msg,
        )
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::SERVICE_UNAVAILABLE,
            msg,
        )
    }

    pub fn into_err<T>(self) -> ApiResult<T> {
        Err((
            self.status,
            Json(ApiResponse {
                code: self.code,
                msg: self.message,
                data: None,
            }),
        ))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ApiResponse::<()> {
            code: self.code,
            msg: self.message,
            data: None,
        });
        (self.status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let msg = format!("{}: {}", err.code(), err);
        match err {
            EngineError::InvalidOrder(_) => {
                Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_ORDER, msg)
            }
            EngineError::InsufficientBalance => Self::new(
                StatusCode::BAD_REQUEST,
                error_codes::INSUFFICIENT_BALANCE,
                msg,
            ),
            EngineError::InsufficientShares => Self::new(
                StatusCode::BAD_REQUEST,
                error_codes::INSUFFICIENT_SHARES,
                msg,
            ),
            EngineError::MarketClosed => {
                Self::new(StatusCode::BAD_REQUEST, error_codes::MARKET_CLOSED, msg)
            }
            EngineError::NotFound => Self::new(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, msg),
            EngineError::NotAuthorized => {
                Self::new(StatusCode::FORBIDDEN, error_codes::NOT_AUTHORIZED, msg)
            }
            EngineError::Conflict(_) => Self::new(StatusCode::CONFLICT, error_codes::CONFLICT, msg),
            EngineError::Timeout => {
                Self::new(StatusCode::REQUEST_TIMEOUT, error_codes::TIMEOUT, msg)
            }
            EngineError::ServiceUnavailable | EngineError::Fatal(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                error_codes::SERVICE_UNAVAILABLE,
                msg,
            ),
        }
    }
}

// ============================================================
// Display helpers (cents -> decimal tokens)
// ============================================================

/// 150 cents -> 1.50 tokens.
#[inline]
pub fn tokens(cents: Cents) -> Decimal {
    Decimal::new(cents as i64, 2)
}

/// Average price per share in tokens from an integer cost basis.
/// (cost 270c over 8 shares -> 0.3375)
pub fn avg_price(cost: Cents, shares: u64) -> Option<Decimal> {
    if shares == 0 {
        None
    } else {
        Some(Decimal::new((cost * 100 / shares) as i64, 4))
    }
}

// ============================================================
// Auth DTOs
// ============================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    #[schema(example = "alice@example.com")]
    pub email: String,
    #[schema(example = "hunter22")]
    pub password: String,
    #[schema(example = "Alice")]
    pub name: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserView {
    pub id: UserId,
    pub email: String,
    pub name: String,
    /// Spendable balance in tokens
    #[schema(value_type = String, example = "1000.00")]
    pub balance: Decimal,
    /// Escrowed against open orders, in tokens
    #[schema(value_type = String, example = "0.00")]
    pub balance_frozen: Decimal,
    pub is_admin: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserView,
}

// ============================================================
// Market DTOs
// ============================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateMarketRequest {
    pub title: String,
    pub description: String,
    /// Unix milliseconds
    pub resolve_at_ms: u64,
    /// Omit for a global market
    pub org_id: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveRequest {
    pub outcome: Outcome,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MarketView {
    pub id: MarketId,
    pub title: String,
    pub description: String,
    pub status: MarketStatus,
    pub outcome: Option<Outcome>,
    pub scope: MarketScope,
    pub created_at_ms: u64,
    pub resolve_at_ms: u64,
    #[schema(value_type = String, example = "0.50")]
    pub yes_price: Decimal,
    #[schema(value_type = String, example = "0.50")]
    pub no_price: Decimal,
    #[schema(value_type = String, example = "120.00")]
    pub volume: Decimal,
}

impl From<&Market> for MarketView {
    fn from(m: &Market) -> Self {
        Self {
            id: m.id,
            title: m.title.clone(),
            description: m.description.clone(),
            status: m.status,
            outcome: m.outcome,
            scope: m.scope,
            created_at_ms: m.created_at_ms,
            resolve_at_ms: m.resolve_at_ms,
            yes_price: tokens(m.yes_price),
            no_price: tokens(m.no_price),
            volume: tokens(m.volume),
        }
    }
}

/// Aggregated orderbook with midpoints, as published to clients.
#[derive(Debug, Serialize)]
pub struct OrderbookView {
    pub market_id: MarketId,
    pub yes: SideLevels,
    pub no: SideLevels,
    pub midpoint_yes: Decimal,
    pub midpoint_no: Decimal,
}

impl OrderbookView {
    pub fn from_snapshot(market_id: MarketId, snapshot: BookSnapshot) -> Self {
        Self {
            market_id,
            midpoint_yes: tokens(snapshot.midpoint_yes),
            midpoint_no: tokens(snapshot.midpoint_no),
            yes: snapshot.yes,
            no: snapshot.no,
        }
    }
}

// ============================================================
// Order DTOs
// ============================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct PlaceOrderRequest {
    pub market_id: MarketId,
    pub side: Side,
    pub kind: OrderKind,
    /// Limit price in cents, 1..=99
    #[schema(example = 60)]
    pub price_cents: Cents,
    #[schema(example = 10)]
    pub quantity: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PlaceMarketOrderRequest {
    pub market_id: MarketId,
    pub side: Side,
    pub kind: OrderKind,
    /// BUY: total cents to spend
    pub token_budget_cents: Option<Cents>,
    /// SELL: shares to dispose of
    pub quantity: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderView {
    pub id: OrderId,
    pub market_id: MarketId,
    pub side: Side,
    pub kind: OrderKind,
    pub price_cents: Cents,
    #[schema(value_type = String, example = "0.60")]
    pub price: Decimal,
    pub quantity: u64,
    pub filled: u64,
    pub status: OrderStatus,
    pub created_at_ms: u64,
}

impl From<&Order> for OrderView {
    fn from(o: &Order) -> Self {
        Self {
            id: o.id,
            market_id: o.market_id,
            side: o.side,
            kind: o.kind,
            price_cents: o.price,
            price: tokens(o.price),
            quantity: o.quantity,
            filled: o.filled,
            status: o.status,
            created_at_ms: o.created_at_ms,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TradeView {
    pub id: TradeId,
    pub market_id: MarketId,
    pub kind: TradeKind,
    pub side: Side,
    pub price_cents: Cents,
    #[schema(value_type = String, example = "0.60")]
    pub price: Decimal,
    pub quantity: u64,
    pub executed_at_ms: u64,
}

impl From<&Trade> for TradeView {
    fn from(t: &Trade) -> Self {
        Self {
            id: t.id,
            market_id: t.market_id,
            kind: t.kind,
            side: t.side,
            price_cents: t.price,
            price: tokens(t.price),
            quantity: t.quantity,
            executed_at_ms: t.executed_at_ms,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PlaceOrderResponse {
    pub order: OrderView,
    pub trades: Vec<TradeView>,
    #[schema(value_type = String, example = "3.00")]
    pub tokens_spent: Decimal,
    #[schema(value_type = String, example = "0.50")]
    pub tokens_refunded: Decimal,
    #[schema(value_type = String, example = "0.00")]
    pub tokens_received: Decimal,
    pub shares_filled: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MarketOrderResponse {
    pub shares_filled: u64,
    pub shares_unfilled: u64,
    #[schema(value_type = String, example = "2.70")]
    pub tokens_spent: Decimal,
    #[schema(value_type = String, example = "0.00")]
    pub tokens_received: Decimal,
    #[schema(value_type = Option<String>, example = "0.3375")]
    pub average_price: Option<Decimal>,
    pub message: String,
}

impl MarketOrderResponse {
    pub fn from_report(report: &Report, requested_desc: &str) -> Self {
        let average_price = report
            .avg_price_centicents()
            .map(|cc| Decimal::new(cc as i64, 4));
        let message = if report.shares_released > 0 || report.tokens_refunded > 0 {
            format!(
                "partially filled {}: {} shares filled",
                requested_desc, report.shares_filled
            )
        } else {
            format!("filled {}: {} shares", requested_desc, report.shares_filled)
        };
        Self {
            shares_filled: report.shares_filled,
            shares_unfilled: report.shares_released,
            tokens_spent: tokens(report.tokens_spent),
            tokens_received: tokens(report.tokens_received),
            average_price,
            message,
        }
    }
}

// ============================================================
// Portfolio DTOs
// ============================================================

#[derive(Debug, Serialize, ToSchema)]
pub struct PositionView {
    pub market_id: MarketId,
    pub market_title: String,
    pub yes_shares: u64,
    pub no_shares: u64,
    #[schema(value_type = Option<String>, example = "0.60")]
    pub avg_yes_price: Option<Decimal>,
    #[schema(value_type = Option<String>, example = "0.40")]
    pub avg_no_price: Option<Decimal>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PortfolioView {
    #[schema(value_type = String, example = "994.00")]
    pub balance: Decimal,
    #[schema(value_type = String, example = "6.00")]
    pub balance_frozen: Decimal,
    pub positions: Vec<PositionView>,
    pub open_orders: Vec<OrderView>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: UserId,
    pub name: String,
    #[schema(value_type = String)]
    pub balance: Decimal,
    #[schema(value_type = String)]
    pub position_value: Decimal,
    #[schema(value_type = String)]
    pub total_value: Decimal,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LeaderboardView {
    pub entries: Vec<LeaderboardEntry>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_formats_cents() {
        assert_eq!(tokens(150).to_string(), "1.50");
        assert_eq!(tokens(0).to_string(), "0.00");
    }

    #[test]
    fn avg_price_scales_to_four_places() {
        assert_eq!(avg_price(270, 8).unwrap().to_string(), "0.3375");
        assert_eq!(avg_price(0, 0), None);
    }

    #[test]
    fn engine_errors_map_to_http() {
        let err = ApiError::from(EngineError::InsufficientBalance);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, error_codes::INSUFFICIENT_BALANCE);
        assert!(err.message.starts_with("INSUFFICIENT_BALANCE"));

        let err = ApiError::from(EngineError::Timeout);
        assert_eq!(err.status, StatusCode::REQUEST_TIMEOUT);
    }
}
