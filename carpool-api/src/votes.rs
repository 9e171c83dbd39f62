use axum::{
    extract::{Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use carpool_core::models::Actor;
use carpool_core::voting::VoteSummary;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub route: String,
    pub travel_date: NaiveDate,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/votes", post(cast_vote))
        .route("/votes/summary", get(vote_summary))
}

/// POST /v1/votes
async fn cast_vote(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteSummary>, AppError> {
    match state.service.vote(&req.route, req.travel_date, actor.id).await {
        Ok(summary) => {
            state.metrics.observe_vote("success");
            Ok(Json(summary))
        }
        Err(err) => {
            state.metrics.observe_vote(&err.code().to_ascii_lowercase());
            Err(err.into())
        }
    }
}

/// GET /v1/votes/summary?route=&travel_date=
async fn vote_summary(
    State(state): State<AppState>,
    Query(query): Query<VoteRequest>,
) -> Result<Json<VoteSummary>, AppError> {
    Ok(Json(state.service.get_vote_summary(&query.route, query.travel_date).await?))
}
