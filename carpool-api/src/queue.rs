use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Extension, Json, Router,
};
use carpool_core::models::{Actor, Role};
use carpool_core::projection::{QueueView, ViewerRole};
use futures_util::{Stream, StreamExt};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cars/{car_id}/queue", get(get_queue))
        .route("/cars/{car_id}/queue/stream", get(queue_stream))
}

fn viewer_for(actor: &Actor) -> ViewerRole {
    match actor.role {
        Role::Driver | Role::Admin | Role::Owner => ViewerRole::Driver,
        Role::Passenger => ViewerRole::Passenger,
    }
}

/// GET /v1/cars/{car_id}/queue
///
/// Drivers, owners and admins get phone numbers and arrival state; passengers get names only.
async fn get_queue(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(car_id): Path<Uuid>,
) -> Result<Json<QueueView>, AppError> {
    let view = state.service.queue_for_car(car_id, viewer_for(&actor)).await?;
    Ok(Json(view))
}

/// GET /v1/cars/{car_id}/queue/stream
///
/// Change notifications for one car. Events carry no queue data; clients re-pull the view.
async fn queue_stream(
    State(state): State<AppState>,
    Path(car_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.service.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result| async move {
        match result {
            Ok(event) if event.car_id == car_id => match Event::default().event(event.event_name()).json_data(&event) {
                Ok(sse) => Some(Ok(sse)),
                Err(e) => {
                    tracing::error!("Failed to encode queue event: {}", e);
                    None
                }
            },
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(%car_id, skipped, "Queue stream lagged");
                Some(Ok(Event::default().event("resync").data(skipped.to_string())))
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
