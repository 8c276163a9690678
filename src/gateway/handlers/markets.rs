//! Market query and admin handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;

use crate::auth::AuthedUser;
use crate::core_types::MarketId;
use crate::gateway::state::AppState;
use crate::gateway::types::{
    ok, ApiError, ApiResult, CreateMarketRequest, MarketView, OrderbookView, ResolveRequest,
    TradeView,
};
use crate::messages::Command;
use crate::models::{MarketScope, MarketStatus};
use crate::orderbook::{BookSnapshot, SideLevels};

#[derive(Debug, Deserialize)]
pub struct MarketListQuery {
    /// "active" (default), "resolved", "deleted" or "all"
    pub status: Option<String>,
    /// Restrict to one organization's markets; omitted = public markets
    pub org_id: Option<u64>,
}

/// List public markets.
///
/// GET /api/v1/markets
#[utoipa::path(
    get,
    path = "/api/v1/markets",
    responses((status = 200, description = "Array of market summaries")),
    tag = "Markets"
)]
pub async fn list_markets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MarketListQuery>,
) -> ApiResult<Vec<MarketView>> {
    let wanted = query.status.as_deref().unwrap_or("active");
    let status_filter = match wanted {
        "active" => Some(MarketStatus::Active),
        "resolved" => Some(MarketStatus::Resolved),
        "deleted" => Some(MarketStatus::Deleted),
        "all" => None,
        other => {
            return ApiError::bad_request(format!("unknown status filter '{other}'")).into_err()
        }
    };

    let scope = match query.org_id {
        Some(org_id) => MarketScope::Org(org_id),
        None => MarketScope::Global,
    };
    let markets = match state.store.load_markets() {
        Ok(markets) => markets,
        Err(err) => return ApiError::service_unavailable(err.to_string()).into_err(),
    };
    let views = markets
        .iter()
        .filter(|m| m.scope == scope)
        .filter(|m| status_filter.map_or(true, |s| m.status == s))
        .map(MarketView::from)
        .collect();
    ok(views)
}

/// Market detail.
///
/// GET /api/v1/markets/{market_id}
#[utoipa::path(
    get,
    path = "/api/v1/markets/{market_id}",
    params(("market_id" = u64, Path, description = "Market id")),
    responses(
        (status = 200, description = "Market detail"),
        (status = 404, description = "Unknown market")
    ),
    tag = "Markets"
)]
pub async fn get_market(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<MarketId>,
) -> ApiResult<MarketView> {
    match state.store.load_markets() {
        Ok(markets) => match markets.iter().find(|m| m.id == market_id) {
            Some(market) => ok(MarketView::from(market)),
            None => ApiError::not_found("market not found").into_err(),
        },
        Err(err) => ApiError::service_unavailable(err.to_string()).into_err(),
    }
}

/// Aggregated orderbook plus midpoints. Served by the market's own
/// worker so the book is read without locks.
///
/// GET /api/v1/markets/{market_id}/orderbook
#[utoipa::path(
    get,
    path = "/api/v1/markets/{market_id}/orderbook",
    params(("market_id" = u64, Path, description = "Market id")),
    responses(
        (status = 200, description = "Aggregated levels and midpoints"),
        (status = 404, description = "Unknown market")
    ),
    tag = "Markets"
)]
pub async fn get_orderbook(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<MarketId>,
) -> ApiResult<OrderbookView> {
    match state.market_handle(market_id) {
        Ok(handle) => match handle.snapshot(state.command_deadline()).await {
            Ok((_, snapshot)) => ok(OrderbookView::from_snapshot(market_id, snapshot)),
            Err(err) => ApiError::from(err).into_err(),
        },
        // No live worker: a resolved/deleted market has an empty book
        Err(_) => match state.store.load_markets() {
            Ok(markets) if markets.iter().any(|m| m.id == market_id) => {
                let market = markets.iter().find(|m| m.id == market_id).cloned();
                let (midpoint_yes, midpoint_no) =
                    market.map(|m| (m.yes_price, m.no_price)).unwrap_or((50, 50));
                ok(OrderbookView::from_snapshot(
                    market_id,
                    BookSnapshot {
                        yes: SideLevels {
                            bids: vec![],
                            asks: vec![],
                        },
                        no: SideLevels {
                            bids: vec![],
                            asks: vec![],
                        },
                        midpoint_yes,
                        midpoint_no,
                    },
                ))
            }
            _ => ApiError::not_found("market not found").into_err(),
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<usize>,
}

/// Recent trades, newest first.
///
/// GET /api/v1/markets/{market_id}/trades
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<MarketId>,
    Query(query): Query<TradesQuery>,
) -> ApiResult<Vec<TradeView>> {
    let limit = query.limit.unwrap_or(50).min(500);
    match state.store.trades_for_market(market_id, limit) {
        Ok(trades) => ok(trades.iter().map(TradeView::from).collect()),
        Err(err) => ApiError::service_unavailable(err.to_string()).into_err(),
    }
}

/// Create a market (admin only).
///
/// POST /api/v1/admin/markets
#[utoipa::path(
    post,
    path = "/api/v1/admin/markets",
    request_body = CreateMarketRequest,
    responses(
        (status = 200, description = "Market created"),
        (status = 403, description = "Caller is not an admin")
    ),
    tag = "Markets"
)]
pub async fn create_market(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<CreateMarketRequest>,
) -> ApiResult<MarketView> {
    if !authed.is_admin {
        return ApiError::forbidden("admin privileges required").into_err();
    }
    if req.title.trim().is_empty() {
        return ApiError::bad_request("title must not be empty").into_err();
    }

    let scope = match req.org_id {
        Some(org_id) => MarketScope::Org(org_id),
        None => MarketScope::Global,
    };
    match state.registry.create_market(
        req.title,
        req.description,
        authed.user_id,
        scope,
        req.resolve_at_ms,
    ) {
        Ok(market) => ok(MarketView::from(&market)),
        Err(err) => ApiError::from(err).into_err(),
    }
}

/// Resolve a market to its outcome and pay winners (admin only).
///
/// POST /api/v1/admin/markets/{market_id}/resolve
#[utoipa::path(
    post,
    path = "/api/v1/admin/markets/{market_id}/resolve",
    params(("market_id" = u64, Path, description = "Market id")),
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Market resolved, payouts applied"),
        (status = 400, description = "Market is not active"),
        (status = 403, description = "Caller is not an admin")
    ),
    tag = "Markets"
)]
pub async fn resolve_market(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
    Path(market_id): Path<MarketId>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<MarketView> {
    if !authed.is_admin {
        return ApiError::forbidden("admin privileges required").into_err();
    }
    let handle = match state.market_handle(market_id) {
        Ok(handle) => handle,
        Err(err) => return ApiError::from(err).into_err(),
    };
    if let Err(err) = handle
        .execute(
            Command::Resolve {
                outcome: req.outcome,
            },
            state.command_deadline(),
        )
        .await
    {
        return ApiError::from(err).into_err();
    }
    match handle.snapshot(state.command_deadline()).await {
        Ok((market, _)) => ok(MarketView::from(&market)),
        Err(err) => ApiError::from(err).into_err(),
    }
}

/// Delete a market, refunding escrow and cost bases (admin only).
///
/// DELETE /api/v1/admin/markets/{market_id}
#[utoipa::path(
    delete,
    path = "/api/v1/admin/markets/{market_id}",
    params(("market_id" = u64, Path, description = "Market id")),
    responses(
        (status = 200, description = "Market deleted with refunds"),
        (status = 403, description = "Caller is not an admin")
    ),
    tag = "Markets"
)]
pub async fn delete_market(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
    Path(market_id): Path<MarketId>,
) -> ApiResult<MarketView> {
    if !authed.is_admin {
        return ApiError::forbidden("admin privileges required").into_err();
    }
    let handle = match state.market_handle(market_id) {
        Ok(handle) => handle,
        Err(err) => return ApiError::from(err).into_err(),
    };
    if let Err(err) = handle.execute(Command::Delete, state.command_deadline()).await {
        return ApiError::from(err).into_err();
    }
    match handle.snapshot(state.command_deadline()).await {
        Ok((market, _)) => ok(MarketView::from(&market)),
        Err(err) => ApiError::from(err).into_err(),
    }
}
