use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::from_fn,
    routing::{get, post},
    Extension, Json, Router,
};
use carpool_core::anomaly::{Anomaly, AnomalyFilter};
use carpool_core::expiry::SweepReport;
use carpool_core::models::{Actor, Car, PendingPayment, Reservation, ReservationDetails};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::require_admin;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateCarRequest {
    pub title: String,
    /// Defaults to the standard capacity.
    pub capacity: Option<u32>,
    pub route: Option<String>,
    pub driver_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AnomalyQuery {
    pub filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub recorded: usize,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cars", post(create_car))
        .route("/payments/pending", get(pending_payments))
        .route("/reservations", get(list_reservations))
        .route("/reservations/{id}/confirm", post(confirm_reservation))
        .route("/reservations/{id}/reject", post(reject_reservation))
        .route("/reservations/{id}/complete", post(complete_reservation))
        .route("/maintenance/sweep", post(run_sweep))
        .route("/anomalies", get(list_anomalies))
        .route("/anomalies/detect", post(detect_anomalies))
        .route("/anomalies/{id}/review", post(review_anomaly))
        .route_layer(from_fn(require_admin))
}

// ============================================================================
// Fleet
// ============================================================================

/// POST /v1/admin/cars
async fn create_car(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateCarRequest>,
) -> Result<(StatusCode, Json<Car>), AppError> {
    let car = state
        .service
        .create_car(&actor, &req.title, req.capacity, req.route, req.driver_id)
        .await?;
    Ok((StatusCode::CREATED, Json(car)))
}

// ============================================================================
// Payment review
// ============================================================================

/// GET /v1/admin/payments/pending
///
/// Low-confidence receipts first, then oldest first.
async fn pending_payments(State(state): State<AppState>) -> Result<Json<Vec<PendingPayment>>, AppError> {
    Ok(Json(state.service.pending_payments().await?))
}

/// GET /v1/admin/reservations?limit=
///
/// Every status, newest first; 100 rows unless a smaller limit is asked for.
async fn list_reservations(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ReservationDetails>>, AppError> {
    Ok(Json(state.service.list_reservations(query.limit).await?))
}

/// POST /v1/admin/reservations/{id}/confirm
async fn confirm_reservation(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.service.confirm_reservation(id, actor.id).await?))
}

/// POST /v1/admin/reservations/{id}/reject
async fn reject_reservation(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.service.reject_reservation(id, actor.id, req.note).await?))
}

/// POST /v1/admin/reservations/{id}/complete
async fn complete_reservation(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(state.service.complete_reservation(id, actor.id).await?))
}

// ============================================================================
// Maintenance
// ============================================================================

/// POST /v1/admin/maintenance/sweep
///
/// Runs the expiry sweep out of band; the worker does the same on its interval.
async fn run_sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    let report = state.service.sweep().await?;
    state.metrics.observe_expired(report.expired);
    Ok(Json(report))
}

// ============================================================================
// Anomalies
// ============================================================================

/// GET /v1/admin/anomalies?filter=all|unreviewed|<type>
async fn list_anomalies(
    State(state): State<AppState>,
    Query(query): Query<AnomalyQuery>,
) -> Result<Json<Vec<Anomaly>>, AppError> {
    let filter: AnomalyFilter = query
        .filter
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(|e: carpool_core::CoreError| AppError::ValidationError(e.to_string()))?;

    Ok(Json(state.service.list_anomalies(&filter).await?))
}

/// POST /v1/admin/anomalies/detect
async fn detect_anomalies(State(state): State<AppState>) -> Result<Json<DetectResponse>, AppError> {
    let recorded = state.service.detect_anomalies().await?;
    state.metrics.observe_anomalies(recorded);
    Ok(Json(DetectResponse { recorded }))
}

/// POST /v1/admin/anomalies/{id}/review
async fn review_anomaly(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<Uuid>,
) -> Result<Json<Anomaly>, AppError> {
    Ok(Json(state.service.review_anomaly(id, &actor).await?))
}
