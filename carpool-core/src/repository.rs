use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::allocation::SeatReservation;
use crate::anomaly::{ActivitySnapshot, Anomaly, AnomalyFilter};
use crate::error::CoreResult;
use crate::lifecycle::Transition;
use crate::models::{
    Actor, Arrival, Car, CarAvailability, NewCar, PassengerProfile, Payment, PendingPayment, Reservation,
    ReservationDetails, VoteKey,
};
use crate::payment::NewPayment;
use crate::projection::QueueRow;
use crate::voting::{ExtraCar, VoteGroup};

/// Durable store of cars, reservations and their satellites.
///
/// Every mutating method is one atomic unit. Implementations serialize `reserve_seat`
/// per car and per passenger, and serialize `cast_vote` against `accept_extra_car`
/// for the same vote group.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_car(&self, car: NewCar, now: DateTime<Utc>) -> CoreResult<Car>;

    async fn get_car(&self, id: Uuid) -> CoreResult<Option<Car>>;

    async fn list_cars(&self) -> CoreResult<Vec<CarAvailability>>;

    async fn upsert_profile(&self, profile: PassengerProfile) -> CoreResult<()>;

    /// Admit a temporary hold or fail with `NotFound`, `AlreadyReserved` or `CarFull`.
    async fn reserve_seat(
        &self,
        car_id: Uuid,
        passenger_id: Uuid,
        now: DateTime<Utc>,
        hold: Duration,
    ) -> CoreResult<SeatReservation>;

    async fn get_reservation(&self, id: Uuid) -> CoreResult<Option<Reservation>>;

    async fn active_reservation(&self, passenger_id: Uuid) -> CoreResult<Option<Reservation>>;

    /// Reservations of every status, newest first, at most `limit` of them.
    async fn list_reservations(&self, limit: u32) -> CoreResult<Vec<ReservationDetails>>;

    /// Store (or replace) the payment for a temporary reservation and set its `low_confidence` flag.
    async fn attach_payment(
        &self,
        payment: NewPayment,
        actor: Actor,
        low_confidence: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<(Reservation, Payment)>;

    async fn get_payment(&self, reservation_id: Uuid) -> CoreResult<Option<Payment>>;

    async fn pending_payments(&self) -> CoreResult<Vec<PendingPayment>>;

    /// Check and apply a lifecycle transition, updating the payment review fields on confirm/reject.
    async fn transition(&self, id: Uuid, transition: Transition, now: DateTime<Utc>) -> CoreResult<Reservation>;

    async fn expired_holds(&self, now: DateTime<Utc>) -> CoreResult<Vec<Reservation>>;

    /// Cancel the hold only if it is still temporary and past its deadline. Returns whether it changed.
    async fn expire_hold(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool>;

    /// Reservations of a car joined with profile and arrival rows. `NotFound` for an unknown car.
    async fn queue_rows(&self, car_id: Uuid) -> CoreResult<Vec<QueueRow>>;

    async fn mark_arrival(
        &self,
        reservation_id: Uuid,
        arrived: bool,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> CoreResult<(Reservation, Arrival)>;

    async fn get_arrival(&self, reservation_id: Uuid) -> CoreResult<Option<Arrival>>;

    /// Insert a vote and return the group's unconsumed count afterwards.
    async fn cast_vote(&self, key: &VoteKey, passenger_id: Uuid, now: DateTime<Utc>) -> CoreResult<u32>;

    async fn unconsumed_votes(&self, key: &VoteKey) -> CoreResult<u32>;

    async fn pending_vote_groups(&self, from: NaiveDate) -> CoreResult<Vec<VoteGroup>>;

    /// Create a car sized from the group's unconsumed votes and consume them.
    async fn accept_extra_car(
        &self,
        key: &VoteKey,
        title: &str,
        standard_capacity: u32,
        now: DateTime<Utc>,
    ) -> CoreResult<(Car, ExtraCar)>;

    /// Delete unconsumed votes for travel dates before `today`.
    async fn purge_stale_votes(&self, today: NaiveDate) -> CoreResult<u64>;

    async fn activity_since(&self, since: DateTime<Utc>, votes_from: NaiveDate) -> CoreResult<ActivitySnapshot>;

    async fn record_anomalies(&self, anomalies: Vec<Anomaly>) -> CoreResult<usize>;

    async fn list_anomalies(&self, filter: &AnomalyFilter) -> CoreResult<Vec<Anomaly>>;

    async fn review_anomaly(&self, id: Uuid, reviewer: Uuid, now: DateTime<Utc>) -> CoreResult<Anomaly>;
}
