//! OpenAPI document for the HTTP surface

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use super::handlers;
use super::types;

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::auth::register,
        handlers::auth::login,
        handlers::markets::list_markets,
        handlers::markets::get_market,
        handlers::markets::get_orderbook,
        handlers::markets::create_market,
        handlers::markets::resolve_market,
        handlers::markets::delete_market,
        handlers::orders::place_order,
        handlers::orders::place_market_order,
        handlers::orders::cancel_order,
        handlers::portfolio::portfolio,
    ),
    components(schemas(
        types::RegisterRequest,
        types::LoginRequest,
        types::UserView,
        types::AuthResponse,
        types::CreateMarketRequest,
        types::ResolveRequest,
        types::MarketView,
        types::PlaceOrderRequest,
        types::PlaceMarketOrderRequest,
        types::OrderView,
        types::TradeView,
        types::PlaceOrderResponse,
        types::MarketOrderResponse,
        types::PositionView,
        types::PortfolioView,
        types::LeaderboardEntry,
        types::LeaderboardView,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "Auth", description = "Registration and login"),
        (name = "Markets", description = "Market queries and admin operations"),
        (name = "Trading", description = "Order placement and cancellation"),
        (name = "Portfolio", description = "Balances and positions")
    )
)]
pub struct ApiDoc;
