//! Bearer authentication
//!
//! HS256 JWTs issued at login, verified by an axum middleware layer that
//! injects the resolved [`AuthedUser`] into the request. Engine commands
//! never see a token; the gateway is the only surface that reads them.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::core_types::UserId;
use crate::gateway::state::AppState;
use crate::gateway::types::ApiError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token encoding failed: {0}")]
    Encode(String),
    #[error("invalid or expired token")]
    Invalid,
}

/// JWT claims. `sub` is the user id, times are Unix seconds.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

pub fn issue_token(
    user_id: UserId,
    secret: &str,
    ttl_hours: i64,
    now_ms: u64,
) -> Result<String, AuthError> {
    let iat = (now_ms / 1_000) as usize;
    let exp = iat + (ttl_hours * 3_600) as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
        iat,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Encode(e.to_string()))
}

pub fn verify_token(token: &str, secret: &str) -> Result<UserId, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AuthError::Invalid)?;
    data.claims.sub.parse().map_err(|_| AuthError::Invalid)
}

/// The resolved caller, attached as a request extension.
#[derive(Debug, Clone, Copy)]
pub struct AuthedUser {
    pub user_id: UserId,
    pub is_admin: bool,
}

/// Axum middleware: require a valid `Authorization: Bearer <jwt>`.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError::unauthorized("missing bearer token").into_response();
    };
    let user_id = match verify_token(token, &state.config.auth.jwt_secret) {
        Ok(id) => id,
        Err(_) => return ApiError::unauthorized("invalid or expired token").into_response(),
    };
    let Some(user) = state.users.get(user_id) else {
        return ApiError::unauthorized("unknown user").into_response();
    };

    req.extensions_mut().insert(AuthedUser {
        user_id,
        is_admin: user.is_admin,
    });
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    #[test]
    fn token_round_trip() {
        let token = issue_token(42, "test-secret", 24, now_ms()).unwrap();
        assert_eq!(verify_token(&token, "test-secret").unwrap(), 42);
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_token(42, "test-secret", 24, now_ms()).unwrap();
        assert!(verify_token(&token, "other-secret").is_err());
    }

    #[test]
    fn expired_token_rejected() {
        // Issued far in the past with a 1 hour ttl
        let token = issue_token(42, "test-secret", 1, 1_500_000_000_000).unwrap();
        assert!(verify_token(&token, "test-secret").is_err());
    }

    #[test]
    fn garbage_token_rejected() {
        assert!(verify_token("not.a.jwt", "test-secret").is_err());
    }
}
