pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;

use crate::auth::require_auth;
use crate::config::AppConfig;
use crate::websocket::ws_handler;
use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    // Public: market data and account creation
    let public_routes = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/markets", get(handlers::markets::list_markets))
        .route("/markets/{market_id}", get(handlers::markets::get_market))
        .route(
            "/markets/{market_id}/orderbook",
            get(handlers::markets::get_orderbook),
        )
        .route(
            "/markets/{market_id}/trades",
            get(handlers::markets::get_trades),
        )
        .route("/leaderboard", get(handlers::portfolio::leaderboard));

    // Private: requires a bearer token; admin checks live in handlers
    let private_routes = Router::new()
        .route("/auth/me", get(handlers::auth::me))
        .route("/portfolio", get(handlers::portfolio::portfolio))
        .route(
            "/orders",
            get(handlers::orders::my_orders).post(handlers::orders::place_order),
        )
        .route("/orders/market", post(handlers::orders::place_market_order))
        .route("/orders/{order_id}", delete(handlers::orders::cancel_order))
        // Admin surface; the admin flag is checked per handler
        .route("/admin/markets", post(handlers::markets::create_market))
        .route(
            "/admin/markets/{market_id}/resolve",
            post(handlers::markets::resolve_market),
        )
        .route(
            "/admin/markets/{market_id}",
            delete(handlers::markets::delete_market),
        )
        .layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/v1/health", get(handlers::health_check))
        .route(
            "/api/v1/openapi.json",
            get(|| async { Json(openapi::ApiDoc::openapi()) }),
        )
        .nest("/api/v1", public_routes.merge(private_routes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve the HTTP/WebSocket gateway.
pub async fn run_server(config: &AppConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("gateway listening on http://{}", addr);
    tracing::info!("websocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
