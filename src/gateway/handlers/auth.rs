//! Registration, login and identity handlers

use std::sync::Arc;

use axum::{extract::State, Extension, Json};

use crate::accounts::{AccountError, UserRecord};
use crate::auth::{issue_token, AuthedUser};
use crate::gateway::state::AppState;
use crate::gateway::types::{ok, tokens, ApiError, ApiResult, AuthResponse, LoginRequest, RegisterRequest, UserView};
use crate::models::MarketScope;

fn user_view(state: &AppState, record: &UserRecord) -> Result<UserView, ApiError> {
    let Ok(ledger) = state.ledger.lock() else {
        return Err(ApiError::internal("ledger unavailable"));
    };
    let balance = ledger.balance(record.id, MarketScope::Global);
    Ok(UserView {
        id: record.id,
        email: record.email.clone(),
        name: record.name.clone(),
        balance: tokens(balance.avail()),
        balance_frozen: tokens(balance.frozen()),
        is_admin: record.is_admin,
    })
}

/// Register a new user; grants the initial token balance.
///
/// POST /api/v1/auth/register
#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "User created, bearer token returned"),
        (status = 400, description = "Email already registered")
    ),
    tag = "Auth"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<AuthResponse> {
    if req.email.trim().is_empty() || !req.email.contains('@') {
        return ApiError::bad_request("invalid email address").into_err();
    }
    if req.password.len() < 6 {
        return ApiError::bad_request("password must be at least 6 characters").into_err();
    }

    let record = match state
        .users
        .register(&req.email, &req.name, &req.password, state.clock.now_ms())
    {
        Ok(record) => record,
        Err(AccountError::EmailTaken) => {
            return ApiError::bad_request("email already registered").into_err()
        }
        Err(err) => return ApiError::internal(err.to_string()).into_err(),
    };

    // Starting grant
    let grant = state.config.economy.initial_balance_cents;
    let balance = {
        let Ok(mut ledger) = state.ledger.lock() else {
            return ApiError::internal("ledger unavailable").into_err();
        };
        match ledger.deposit(record.id, MarketScope::Global, grant) {
            Ok(balance) => balance,
            Err(err) => return ApiError::internal(err.to_string()).into_err(),
        }
    };
    // Recovery rebuilds state from the store; a user that never lands
    // there would vanish on restart despite holding a live token
    if let Err(err) = state.store.save_user(&record) {
        return ApiError::service_unavailable(err.to_string()).into_err();
    }
    if let Err(err) = state
        .store
        .save_balance(record.id, MarketScope::Global, balance)
    {
        return ApiError::service_unavailable(err.to_string()).into_err();
    }

    let token = match issue_token(
        record.id,
        &state.config.auth.jwt_secret,
        state.config.auth.token_ttl_hours,
        state.clock.now_ms(),
    ) {
        Ok(token) => token,
        Err(err) => return ApiError::internal(err.to_string()).into_err(),
    };

    let user = match user_view(&state, &record) {
        Ok(user) => user,
        Err(err) => return err.into_err(),
    };
    ok(AuthResponse { token, user })
}

/// Login with email + password.
///
/// POST /api/v1/auth/login
#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Bearer token returned"),
        (status = 401, description = "Invalid credentials")
    ),
    tag = "Auth"
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<AuthResponse> {
    let record = match state.users.authenticate(&req.email, &req.password) {
        Ok(record) => record,
        Err(_) => return ApiError::unauthorized("invalid email or password").into_err(),
    };

    let token = match issue_token(
        record.id,
        &state.config.auth.jwt_secret,
        state.config.auth.token_ttl_hours,
        state.clock.now_ms(),
    ) {
        Ok(token) => token,
        Err(err) => return ApiError::internal(err.to_string()).into_err(),
    };

    let user = match user_view(&state, &record) {
        Ok(user) => user,
        Err(err) => return err.into_err(),
    };
    ok(AuthResponse { token, user })
}

/// Current user record.
///
/// GET /api/v1/auth/me
pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(authed): Extension<AuthedUser>,
) -> ApiResult<UserView> {
    match state.users.get(authed.user_id) {
        Some(record) => match user_view(&state, &record) {
            Ok(user) => ok(user),
            Err(err) => err.into_err(),
        },
        None => ApiError::not_found("user not found").into_err(),
    }
}
