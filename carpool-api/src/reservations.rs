use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use carpool_core::models::{Actor, Arrival, Payment, Reservation};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::rate_limit::check_payment_limit;
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitPaymentRequest {
    /// Storage reference of the uploaded receipt screenshot.
    pub image_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct ArrivalRequest {
    pub arrived: bool,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/reservations/me", get(my_reservation))
        .route("/reservations/{id}/payment", post(submit_payment))
        .route("/reservations/{id}/cancel", post(cancel_reservation))
        .route("/reservations/{id}/arrival", post(mark_arrival))
}

/// GET /v1/reservations/me
///
/// The caller's active reservation, or `null`.
async fn my_reservation(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<Option<Reservation>>, AppError> {
    Ok(Json(state.service.active_reservation(actor.id).await?))
}

/// POST /v1/reservations/{id}/payment
async fn submit_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitPaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    if req.image_ref.trim().is_empty() {
        return Err(AppError::ValidationError("image_ref must not be empty".to_string()));
    }
    check_payment_limit(&state, &actor.id).await?;

    let payment = state.service.submit_payment(id, &actor, req.image_ref.trim()).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

/// POST /v1/reservations/{id}/cancel
async fn cancel_reservation(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.service.cancel_reservation(id, &actor).await?))
}

/// POST /v1/reservations/{id}/arrival
async fn mark_arrival(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(req): Json<ArrivalRequest>,
) -> Result<Json<Arrival>, AppError> {
    Ok(Json(state.service.mark_arrival(id, req.arrived, &actor).await?))
}
