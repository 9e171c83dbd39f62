use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use carpool_core::models::{Actor, CarAvailability};
use carpool_core::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ReserveSeatResponse {
    pub success: bool,
    pub reservation_id: Option<Uuid>,
    pub order_number: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub message: String,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cars", get(list_cars))
        .route("/cars/{car_id}/reservations", post(reserve_seat))
}

/// GET /v1/cars
async fn list_cars(State(state): State<AppState>) -> Result<Json<Vec<CarAvailability>>, AppError> {
    Ok(Json(state.service.list_cars().await?))
}

/// POST /v1/cars/{car_id}/reservations
///
/// Takes a temporary hold on the next seat. A full car or an existing active
/// reservation is an expected outcome and answers 409 with `success: false`.
async fn reserve_seat(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(car_id): Path<Uuid>,
) -> Result<(StatusCode, Json<ReserveSeatResponse>), AppError> {
    match state.service.reserve_seat(car_id, actor.id).await {
        Ok(seat) => {
            state.metrics.observe_reservation("success");
            Ok((
                StatusCode::CREATED,
                Json(ReserveSeatResponse {
                    success: true,
                    reservation_id: Some(seat.reservation_id),
                    order_number: Some(seat.order_number),
                    expires_at: Some(seat.expires_at),
                    message: format!("Seat #{} held until {}", seat.order_number, seat.expires_at.to_rfc3339()),
                }),
            ))
        }
        Err(err @ (CoreError::AlreadyReserved(_) | CoreError::CarFull(_))) => {
            state.metrics.observe_reservation(&err.code().to_ascii_lowercase());
            Ok((
                StatusCode::CONFLICT,
                Json(ReserveSeatResponse {
                    success: false,
                    reservation_id: None,
                    order_number: None,
                    expires_at: None,
                    message: err.code().to_string(),
                }),
            ))
        }
        Err(err) => {
            state.metrics.observe_reservation("error");
            Err(err.into())
        }
    }
}
