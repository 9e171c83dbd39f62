use uuid::Uuid;

/// What happened to a car's queue. Consumers re-pull the projection on receipt.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueChange {
    SeatReserved,
    PaymentSubmitted,
    Confirmed,
    Rejected,
    Cancelled,
    Expired,
    Completed,
    ArrivalMarked,
    CarCreated,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct QueueChangedEvent {
    pub car_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub change: QueueChange,
    pub at: i64,
}

impl QueueChangedEvent {
    pub fn new(car_id: Uuid, reservation_id: Option<Uuid>, change: QueueChange, at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            car_id,
            reservation_id,
            change,
            at: at.timestamp(),
        }
    }

    /// SSE event name, e.g. `seat_reserved`.
    pub fn event_name(&self) -> &'static str {
        match self.change {
            QueueChange::SeatReserved => "seat_reserved",
            QueueChange::PaymentSubmitted => "payment_submitted",
            QueueChange::Confirmed => "confirmed",
            QueueChange::Rejected => "rejected",
            QueueChange::Cancelled => "cancelled",
            QueueChange::Expired => "expired",
            QueueChange::Completed => "completed",
            QueueChange::ArrivalMarked => "arrival_marked",
            QueueChange::CarCreated => "car_created",
        }
    }
}
