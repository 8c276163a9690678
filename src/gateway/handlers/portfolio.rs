//! Portfolio and leaderboard handlers

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Extension,
};
use serde::Deserialize;

use crate::auth::AuthedUser;
use crate::gateway::state::AppState;
use crate::gateway::types::{
    avg_price, ok, tokens, ApiError, ApiResult, LeaderboardEntry, LeaderboardView, OrderView,
    PortfolioView, PositionView,
};
use crate::models::{Market, MarketScope, OrderStatus};

/// Balance, positions and open orders for the caller.
///
/// GET /api/v1/portfolio
#[utoipa::path(
    get,
    path = "/api/v1/portfolio",
    responses((status = 200, description = "Balance, positions, open orders")),
    security(("bearer_auth" = [])),
    tag = "Portfolio"
)]
pub async fn portfolio(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
) -> ApiResult<PortfolioView> {
    let markets = match state.store.load_markets() {
        Ok(markets) => markets,
        Err(err) => return ApiError::service_unavailable(err.to_string()).into_err(),
    };
    let title_of = |id| {
        markets
            .iter()
            .find(|m: &&Market| m.id == id)
            .map(|m| m.title.clone())
            .unwrap_or_default()
    };

    let (balance, holdings) = {
        let Ok(ledger) = state.ledger.lock() else {
            return ApiError::internal("ledger unavailable").into_err();
        };
        (
            ledger.balance(authed.user_id, MarketScope::Global),
            ledger.positions_for_user(authed.user_id),
        )
    };

    let positions = holdings
        .iter()
        .map(|(market_id, pos)| PositionView {
            market_id: *market_id,
            market_title: title_of(*market_id),
            yes_shares: pos.yes.shares,
            no_shares: pos.no.shares,
            avg_yes_price: avg_price(pos.yes.cost, pos.yes.shares),
            avg_no_price: avg_price(pos.no.cost, pos.no.shares),
        })
        .collect();

    let open_orders = match state.store.orders_for_user(authed.user_id, None) {
        Ok(orders) => orders
            .iter()
            .filter(|o| matches!(o.status, OrderStatus::Open | OrderStatus::Partial))
            .map(OrderView::from)
            .collect(),
        Err(err) => return ApiError::service_unavailable(err.to_string()).into_err(),
    };

    ok(PortfolioView {
        balance: tokens(balance.avail()),
        balance_frozen: tokens(balance.frozen()),
        positions,
        open_orders,
    })
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// Users ranked by balance plus positions marked at current midpoints.
///
/// GET /api/v1/leaderboard
pub async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<LeaderboardView> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(10).clamp(1, 100);

    let markets = match state.store.load_markets() {
        Ok(markets) => markets,
        Err(err) => return ApiError::service_unavailable(err.to_string()).into_err(),
    };
    let users = state.users.all();

    let mut ranked: Vec<(u64, String, u64, u64)> = {
        let Ok(ledger) = state.ledger.lock() else {
            return ApiError::internal("ledger unavailable").into_err();
        };
        users
            .iter()
            .map(|user| {
                let balance = ledger.balance(user.id, MarketScope::Global);
                let total_balance = balance.avail() + balance.frozen();
                // Mark open positions at the market's published midpoints
                let position_value: u64 = ledger
                    .positions_for_user(user.id)
                    .iter()
                    .filter_map(|(market_id, pos)| {
                        markets
                            .iter()
                            .find(|m| m.id == *market_id && m.is_active())
                            .map(|m| {
                                pos.yes.shares * m.yes_price + pos.no.shares * m.no_price
                            })
                    })
                    .sum();
                (user.id, user.name.clone(), total_balance, position_value)
            })
            .collect()
    };
    ranked.sort_by_key(|(id, _, balance, positions)| (std::cmp::Reverse(balance + positions), *id));

    let total = ranked.len();
    let total_pages = total.div_ceil(page_size).max(1);
    let entries = ranked
        .into_iter()
        .enumerate()
        .skip((page - 1) * page_size)
        .take(page_size)
        .map(|(i, (user_id, name, balance, position_value))| LeaderboardEntry {
            rank: i + 1,
            user_id,
            name,
            balance: tokens(balance),
            position_value: tokens(position_value),
            total_value: tokens(balance + position_value),
        })
        .collect();

    ok(LeaderboardView {
        entries,
        total,
        page,
        page_size,
        total_pages,
    })
}
