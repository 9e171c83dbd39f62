use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use carpool_core::models::{Actor, Role};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

/// Tokens are issued by the identity provider; this service only verifies them.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn actor(&self) -> Result<Actor, AppError> {
        let id = Uuid::parse_str(&self.sub)
            .map_err(|_| AppError::AuthenticationError("subject is not a valid id".to_string()))?;
        let role: Role = self
            .role
            .parse()
            .map_err(|_| AppError::AuthenticationError(format!("unknown role '{}'", self.role)))?;
        Ok(Actor::new(id, role))
    }
}

pub fn decode_actor(token: &str, secret: &str) -> Result<Actor, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| AppError::AuthenticationError(format!("invalid token: {}", e)))?;

    token_data.claims.actor()
}

// ============================================================================
// Authentication Middleware
// ============================================================================

/// Verify the bearer token and attach the caller's `Actor` to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or_else(|| AppError::AuthenticationError("missing bearer token".to_string()))?;

    let actor = decode_actor(bearer.token(), &state.auth.secret)?;
    req.extensions_mut().insert(actor);

    Ok(next.run(req).await)
}

// ============================================================================
// Role Gates
// ============================================================================

fn require(req: &Request, allowed: &[Role]) -> Result<(), AppError> {
    let actor = req
        .extensions()
        .get::<Actor>()
        .ok_or_else(|| AppError::AuthenticationError("no authenticated actor".to_string()))?;

    if allowed.contains(&actor.role) {
        Ok(())
    } else {
        Err(AppError::AuthorizationError(format!("role {:?} is not allowed here", actor.role)))
    }
}

pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    require(&req, &[Role::Admin])?;
    Ok(next.run(req).await)
}

pub async fn require_owner(req: Request, next: Next) -> Result<Response, AppError> {
    require(&req, &[Role::Owner, Role::Admin])?;
    Ok(next.run(req).await)
}
