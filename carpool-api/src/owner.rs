use axum::{
    extract::State,
    http::StatusCode,
    middleware::from_fn,
    routing::{get, post},
    Extension, Json, Router,
};
use carpool_core::models::Actor;
use carpool_core::voting::{ExtraCar, VoteGroup};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::AppError;
use crate::middleware::require_owner;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AcceptExtraCarRequest {
    pub route: String,
    pub travel_date: NaiveDate,
    pub title: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/vote-groups", get(vote_groups))
        .route("/extra-cars", post(accept_extra_car))
        .route_layer(from_fn(require_owner))
}

/// GET /v1/owner/vote-groups
async fn vote_groups(State(state): State<AppState>) -> Result<Json<Vec<VoteGroup>>, AppError> {
    Ok(Json(state.service.pending_vote_groups().await?))
}

/// POST /v1/owner/extra-cars
///
/// Turns a vote group into a new car sized to the group.
async fn accept_extra_car(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<AcceptExtraCarRequest>,
) -> Result<(StatusCode, Json<ExtraCar>), AppError> {
    let extra = state
        .service
        .accept_extra_car(&req.route, req.travel_date, &req.title, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(extra)))
}
