use axum::{
    extract::State,
    http::StatusCode,
    routing::put,
    Extension, Json, Router,
};
use carpool_core::models::{Actor, PassengerProfile};
use carpool_shared::pii::Masked;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ProfileRequest {
    pub name: String,
    pub phone: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/profile", put(upsert_profile))
}

/// PUT /v1/profile
///
/// Display name and phone shown in queue views.
async fn upsert_profile(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<ProfileRequest>,
) -> Result<StatusCode, AppError> {
    let phone = req
        .phone
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(Masked::new);

    state
        .service
        .upsert_profile(PassengerProfile { id: actor.id, name: req.name.trim().to_string(), phone })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
