//! Order placement and cancellation handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;

use crate::auth::AuthedUser;
use crate::core_types::OrderId;
use crate::gateway::state::AppState;
use crate::gateway::types::{
    ok, tokens, ApiError, ApiResult, MarketOrderResponse, OrderView, PlaceMarketOrderRequest,
    PlaceOrderRequest, PlaceOrderResponse, TradeView,
};
use crate::messages::{Command, MarketOrderSpec, Report};
use crate::models::{OrderKind, OrderStatus};

fn order_response(report: Report) -> ApiResult<PlaceOrderResponse> {
    let Some(order) = report.order.as_ref() else {
        return ApiError::internal("report missing order").into_err();
    };
    ok(PlaceOrderResponse {
        order: OrderView::from(order),
        trades: report.trades.iter().map(TradeView::from).collect(),
        tokens_spent: tokens(report.tokens_spent),
        tokens_refunded: tokens(report.tokens_refunded),
        tokens_received: tokens(report.tokens_received),
        shares_filled: report.shares_filled,
    })
}

/// Place a limit order.
///
/// POST /api/v1/orders
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = PlaceOrderRequest,
    responses(
        (status = 200, description = "Order accepted; report with fills"),
        (status = 400, description = "Invalid order or insufficient funds/shares"),
        (status = 404, description = "Unknown market"),
        (status = 408, description = "Command queue full before deadline")
    ),
    security(("bearer_auth" = [])),
    tag = "Trading"
)]
pub async fn place_order(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<PlaceOrderRequest>,
) -> ApiResult<PlaceOrderResponse> {
    // Cheap shape checks here; price/balance rules belong to the engine
    if req.quantity == 0 {
        return ApiError::bad_request("quantity must be positive").into_err();
    }
    let handle = match state.market_handle(req.market_id) {
        Ok(handle) => handle,
        Err(err) => return ApiError::from(err).into_err(),
    };

    tracing::info!(
        user = authed.user_id,
        market = req.market_id,
        side = ?req.side,
        kind = ?req.kind,
        price = req.price_cents,
        qty = req.quantity,
        "limit order received"
    );

    let cmd = Command::PlaceLimit {
        user: authed.user_id,
        side: req.side,
        kind: req.kind,
        price: req.price_cents,
        quantity: req.quantity,
    };
    match handle.execute(cmd, state.command_deadline()).await {
        Ok(report) => order_response(report),
        Err(err) => ApiError::from(err).into_err(),
    }
}

/// Place a market order: BUY by token budget, SELL by quantity.
///
/// POST /api/v1/orders/market
#[utoipa::path(
    post,
    path = "/api/v1/orders/market",
    request_body = PlaceMarketOrderRequest,
    responses(
        (status = 200, description = "Report with shares filled, spend and average price"),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Unknown market")
    ),
    security(("bearer_auth" = [])),
    tag = "Trading"
)]
pub async fn place_market_order(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<PlaceMarketOrderRequest>,
) -> ApiResult<MarketOrderResponse> {
    let (spec, desc) = match req.kind {
        OrderKind::Buy => match req.token_budget_cents {
            Some(budget) if budget > 0 => (
                MarketOrderSpec::BuyBudget(budget),
                format!("buy budget {}c", budget),
            ),
            _ => {
                return ApiError::bad_request("market BUY requires token_budget_cents > 0")
                    .into_err()
            }
        },
        OrderKind::Sell => match req.quantity {
            Some(qty) if qty > 0 => (
                MarketOrderSpec::SellQuantity(qty),
                format!("sell {} shares", qty),
            ),
            _ => return ApiError::bad_request("market SELL requires quantity > 0").into_err(),
        },
    };

    let handle = match state.market_handle(req.market_id) {
        Ok(handle) => handle,
        Err(err) => return ApiError::from(err).into_err(),
    };
    let cmd = Command::PlaceMarket {
        user: authed.user_id,
        side: req.side,
        spec,
    };
    match handle.execute(cmd, state.command_deadline()).await {
        Ok(report) => ok(MarketOrderResponse::from_report(&report, &desc)),
        Err(err) => ApiError::from(err).into_err(),
    }
}

/// Cancel an open order (owner only).
///
/// DELETE /api/v1/orders/{order_id}
#[utoipa::path(
    delete,
    path = "/api/v1/orders/{order_id}",
    params(("order_id" = u64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order cancelled, remainder refunded"),
        (status = 403, description = "Not the order owner"),
        (status = 404, description = "Unknown order"),
        (status = 409, description = "Order is not open")
    ),
    security(("bearer_auth" = [])),
    tag = "Trading"
)]
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
    Path(order_id): Path<OrderId>,
) -> ApiResult<OrderView> {
    // Orders are market-scoped; find the market first
    let market_id = match state.store.order(order_id) {
        Ok(Some(order)) => order.market_id,
        Ok(None) => return ApiError::not_found("order not found").into_err(),
        Err(err) => return ApiError::service_unavailable(err.to_string()).into_err(),
    };
    let handle = match state.market_handle(market_id) {
        Ok(handle) => handle,
        Err(err) => return ApiError::from(err).into_err(),
    };

    let cmd = Command::Cancel {
        order_id,
        user: authed.user_id,
    };
    match handle.execute(cmd, state.command_deadline()).await {
        Ok(report) => match report.order {
            Some(order) => ok(OrderView::from(&order)),
            None => ApiError::internal("report missing order").into_err(),
        },
        Err(err) => ApiError::from(err).into_err(),
    }
}

#[derive(Debug, Deserialize)]
pub struct MyOrdersQuery {
    /// OPEN, PARTIAL, FILLED or CANCELLED
    pub status: Option<String>,
}

/// The caller's orders, newest first.
///
/// GET /api/v1/orders
pub async fn my_orders(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
    Query(query): Query<MyOrdersQuery>,
) -> ApiResult<Vec<OrderView>> {
    let status = match query.status.as_deref() {
        None => None,
        Some("OPEN") => Some(OrderStatus::Open),
        Some("PARTIAL") => Some(OrderStatus::Partial),
        Some("FILLED") => Some(OrderStatus::Filled),
        Some("CANCELLED") => Some(OrderStatus::Cancelled),
        Some(other) => {
            return ApiError::bad_request(format!("unknown status filter '{other}'")).into_err()
        }
    };
    match state.store.orders_for_user(authed.user_id, status) {
        Ok(orders) => ok(orders.iter().map(OrderView::from).collect()),
        Err(err) => ApiError::service_unavailable(err.to_string()).into_err(),
    }
}
