use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use carpool_store::redis_repo::{ip_rate_key, payment_rate_key};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

const WINDOW_SECONDS: i64 = 60;

/// Count one hit against `key`. Redis errors and a missing Redis both let the request through.
async fn allow(state: &AppState, key: &str, limit: i64) -> bool {
    let Some(redis) = state.redis.as_ref() else {
        return true;
    };

    match redis.check_rate_limit(key, limit, WINDOW_SECONDS).await {
        Ok(allowed) => allowed,
        Err(e) => {
            tracing::warn!("Rate limiter unavailable, failing open: {}", e);
            true
        }
    }
}

/// Global per-IP limit.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // Absent when the app is driven without a socket (tests, in-process calls).
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    if let Some(ip) = ip {
        if !allow(&state, &ip_rate_key(&ip), state.rate_limits.per_minute).await {
            tracing::warn!(%ip, "Rate limit exceeded");
            return Err(AppError::RateLimited);
        }
    }

    Ok(next.run(req).await)
}

/// Per-user limit on payment submissions.
pub async fn check_payment_limit(state: &AppState, user_id: &Uuid) -> Result<(), AppError> {
    if allow(state, &payment_rate_key(user_id), state.rate_limits.payment_per_minute).await {
        Ok(())
    } else {
        tracing::warn!(%user_id, "Payment submission rate limit exceeded");
        Err(AppError::RateLimited)
    }
}
