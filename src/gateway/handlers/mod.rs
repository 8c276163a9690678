pub mod auth;
pub mod markets;
pub mod orders;
pub mod portfolio;

use crate::gateway::types::{ok, ApiResult};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /api/v1/health
pub async fn health_check() -> ApiResult<Health> {
    ok(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
