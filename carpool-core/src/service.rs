//! `ReservationService`: the operations exposed to request handlers and the maintenance worker.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;
use carpool_shared::models::events::{QueueChange, QueueChangedEvent};

use crate::allocation::SeatReservation;
use crate::anomaly::{self, Anomaly, AnomalyFilter};
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::expiry::{ExpirySweeper, SweepReport};
use crate::lifecycle::Transition;
use crate::models::{Actor, Arrival, Car, CarAvailability, NewCar, PassengerProfile, Payment, PendingPayment, Reservation, ReservationDetails, VoteKey};
use crate::payment::{self, NewPayment, PaymentVerifier};
use crate::policy::{ReservationPolicy, MAX_CAR_CAPACITY, RESERVATION_HISTORY_LIMIT};
use crate::projection::{self, QueueView, ViewerRole};
use crate::repository::Ledger;
use crate::voting::{self, ExtraCar, VoteGroup, VoteSummary};

const EVENT_BUFFER: usize = 256;

pub struct ReservationService {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    verifier: Arc<dyn PaymentVerifier>,
    policy: ReservationPolicy,
    sweeper: ExpirySweeper,
    events: broadcast::Sender<QueueChangedEvent>,
}

impl ReservationService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn PaymentVerifier>,
        policy: ReservationPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sweeper: ExpirySweeper::new(ledger.clone()),
            ledger,
            clock,
            verifier,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &ReservationPolicy {
        &self.policy
    }

    /// Queue change notifications for every car. Lagging receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueChangedEvent> {
        self.events.subscribe()
    }

    fn publish(&self, car_id: Uuid, reservation_id: Option<Uuid>, change: QueueChange) {
        // No receivers is fine: the stream is a hint to re-pull.
        let _ = self
            .events
            .send(QueueChangedEvent::new(car_id, reservation_id, change, self.clock.now()));
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    // ========================================================================
    // Cars and profiles
    // ========================================================================

    pub async fn create_car(
        &self,
        actor: &Actor,
        title: &str,
        capacity: Option<u32>,
        route: Option<String>,
        driver_id: Option<Uuid>,
    ) -> CoreResult<Car> {
        let title = title.trim();
        if title.is_empty() {
            return Err(CoreError::Validation("car title must not be empty".to_string()));
        }
        let capacity = capacity.unwrap_or(self.policy.standard_capacity);
        if !(1..=MAX_CAR_CAPACITY).contains(&capacity) {
            return Err(CoreError::Validation(format!(
                "capacity must be between 1 and {}, got {}",
                MAX_CAR_CAPACITY, capacity
            )));
        }
        let route = route.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());

        let car = self
            .ledger
            .create_car(NewCar { title: title.to_string(), capacity, route, driver_id }, self.clock.now())
            .await?;

        info!(target: "audit", actor_id = %actor.id, action = "create_car", car_id = %car.id, capacity);
        self.publish(car.id, None, QueueChange::CarCreated);
        Ok(car)
    }

    pub async fn list_cars(&self) -> CoreResult<Vec<CarAvailability>> {
        self.ledger.list_cars().await
    }

    pub async fn upsert_profile(&self, profile: PassengerProfile) -> CoreResult<()> {
        if profile.name.trim().is_empty() {
            return Err(CoreError::Validation("name must not be empty".to_string()));
        }
        self.ledger.upsert_profile(profile).await
    }

    // ========================================================================
    // Seat allocation
    // ========================================================================

    pub async fn reserve_seat(&self, car_id: Uuid, passenger_id: Uuid) -> CoreResult<SeatReservation> {
        let hold = self.policy.hold_duration();
        let seat = self
            .policy
            .reserve_retry
            .run(|| self.ledger.reserve_seat(car_id, passenger_id, self.clock.now(), hold))
            .await?;

        info!(
            target: "audit",
            actor_id = %passenger_id,
            action = "reserve_seat",
            car_id = %car_id,
            reservation_id = %seat.reservation_id,
            order_number = seat.order_number,
        );
        self.publish(car_id, Some(seat.reservation_id), QueueChange::SeatReserved);
        Ok(seat)
    }

    pub async fn active_reservation(&self, passenger_id: Uuid) -> CoreResult<Option<Reservation>> {
        self.ledger.active_reservation(passenger_id).await
    }

    pub async fn get_reservation(&self, id: Uuid) -> CoreResult<Reservation> {
        self.ledger
            .get_reservation(id)
            .await?
            .ok_or_else(|| CoreError::not_found("reservation", id))
    }

    /// Admin history across every status, newest first. The limit is capped at
    /// `RESERVATION_HISTORY_LIMIT`.
    pub async fn list_reservations(&self, limit: Option<u32>) -> CoreResult<Vec<ReservationDetails>> {
        let limit = limit
            .unwrap_or(RESERVATION_HISTORY_LIMIT)
            .clamp(1, RESERVATION_HISTORY_LIMIT);
        self.ledger.list_reservations(limit).await
    }

    // ========================================================================
    // Payments and review
    // ========================================================================

    /// Score the screenshot, then attach it. The verifier runs before any ledger lock is taken.
    pub async fn submit_payment(&self, reservation_id: Uuid, actor: &Actor, image_ref: &str) -> CoreResult<Payment> {
        if image_ref.trim().is_empty() {
            return Err(CoreError::Validation("image reference must not be empty".to_string()));
        }
        let reservation = self.get_reservation(reservation_id).await?;
        payment::check_submission(&reservation, actor)?;

        let verification = self.verifier.verify(image_ref).await?;
        let low_confidence = self.policy.is_low_confidence(verification.normalized_confidence());
        let new_payment = NewPayment {
            reservation_id,
            image_ref: image_ref.to_string(),
            verification,
        };

        let (reservation, stored) = self
            .ledger
            .attach_payment(new_payment, *actor, low_confidence, self.clock.now())
            .await?;

        info!(
            target: "audit",
            actor_id = %actor.id,
            action = "submit_payment",
            reservation_id = %reservation_id,
            confidence = stored.ai_confidence,
            low_confidence,
        );
        self.publish(reservation.car_id, Some(reservation_id), QueueChange::PaymentSubmitted);
        Ok(stored)
    }

    pub async fn pending_payments(&self) -> CoreResult<Vec<PendingPayment>> {
        self.ledger.pending_payments().await
    }

    pub async fn confirm_reservation(&self, reservation_id: Uuid, admin_id: Uuid) -> CoreResult<Reservation> {
        self.transition(reservation_id, admin_id, Transition::Confirm { admin_id }).await
    }

    pub async fn reject_reservation(
        &self,
        reservation_id: Uuid,
        admin_id: Uuid,
        note: Option<String>,
    ) -> CoreResult<Reservation> {
        let note = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        self.transition(reservation_id, admin_id, Transition::Reject { admin_id, note }).await
    }

    pub async fn cancel_reservation(&self, reservation_id: Uuid, actor: &Actor) -> CoreResult<Reservation> {
        self.transition(reservation_id, actor.id, Transition::Cancel { actor: *actor }).await
    }

    pub async fn complete_reservation(&self, reservation_id: Uuid, admin_id: Uuid) -> CoreResult<Reservation> {
        self.transition(reservation_id, admin_id, Transition::Complete).await
    }

    async fn transition(&self, reservation_id: Uuid, actor_id: Uuid, transition: Transition) -> CoreResult<Reservation> {
        let action = transition.action();
        let change = transition.change();
        let reservation = self.ledger.transition(reservation_id, transition, self.clock.now()).await?;

        info!(
            target: "audit",
            actor_id = %actor_id,
            action,
            reservation_id = %reservation_id,
            status = %reservation.status,
        );
        self.publish(reservation.car_id, Some(reservation_id), change);
        Ok(reservation)
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    pub async fn sweep(&self) -> CoreResult<SweepReport> {
        let report = self.sweeper.sweep(self.clock.now()).await?;
        for (car_id, reservation_id) in &report.released {
            self.publish(*car_id, Some(*reservation_id), QueueChange::Expired);
        }
        if report.expired > 0 || report.failed > 0 {
            info!(expired = report.expired, failed = report.failed, "Expiry sweep finished");
        }
        Ok(report)
    }

    pub async fn sweep_expired(&self) -> CoreResult<usize> {
        Ok(self.sweep().await?.expired)
    }

    // ========================================================================
    // Queue and arrivals
    // ========================================================================

    pub async fn queue_for_car(&self, car_id: Uuid, viewer: ViewerRole) -> CoreResult<QueueView> {
        let rows = self.ledger.queue_rows(car_id).await?;
        Ok(projection::build(rows, viewer))
    }

    pub async fn mark_arrival(&self, reservation_id: Uuid, arrived: bool, actor: &Actor) -> CoreResult<Arrival> {
        let (reservation, arrival) = self
            .ledger
            .mark_arrival(reservation_id, arrived, *actor, self.clock.now())
            .await?;

        info!(target: "audit", actor_id = %actor.id, action = "mark_arrival", reservation_id = %reservation_id, arrived);
        self.publish(reservation.car_id, Some(reservation_id), QueueChange::ArrivalMarked);
        Ok(arrival)
    }

    // ========================================================================
    // Demand voting
    // ========================================================================

    pub async fn vote(&self, route: &str, travel_date: NaiveDate, passenger_id: Uuid) -> CoreResult<VoteSummary> {
        let key = VoteKey::new(route, travel_date);
        voting::validate(&key, self.today())?;

        let votes_count = self.ledger.cast_vote(&key, passenger_id, self.clock.now()).await?;
        let summary = VoteSummary::new(votes_count, self.policy.vote_threshold);

        info!(target: "audit", actor_id = %passenger_id, action = "vote", group = %key, votes_count);
        if summary.is_triggered() {
            info!(group = %key, votes_count, "Vote group reached the extra-car threshold");
        }
        Ok(summary)
    }

    pub async fn get_vote_summary(&self, route: &str, travel_date: NaiveDate) -> CoreResult<VoteSummary> {
        let key = VoteKey::new(route, travel_date);
        let votes_count = self.ledger.unconsumed_votes(&key).await?;
        Ok(VoteSummary::new(votes_count, self.policy.vote_threshold))
    }

    pub async fn pending_vote_groups(&self) -> CoreResult<Vec<VoteGroup>> {
        self.ledger.pending_vote_groups(self.today()).await
    }

    pub async fn accept_extra_car(
        &self,
        route: &str,
        travel_date: NaiveDate,
        title: &str,
        actor: &Actor,
    ) -> CoreResult<ExtraCar> {
        let key = VoteKey::new(route, travel_date);
        let title = title.trim();
        if key.route.is_empty() || title.is_empty() {
            return Err(CoreError::Validation("route and title must not be empty".to_string()));
        }

        let (car, extra) = self
            .ledger
            .accept_extra_car(&key, title, self.policy.standard_capacity, self.clock.now())
            .await?;

        info!(
            target: "audit",
            actor_id = %actor.id,
            action = "accept_extra_car",
            group = %key,
            car_id = %car.id,
            capacity = extra.capacity,
            consumed_votes = extra.consumed_votes,
        );
        self.publish(car.id, None, QueueChange::CarCreated);
        Ok(extra)
    }

    pub async fn purge_stale_votes(&self) -> CoreResult<u64> {
        let purged = self.ledger.purge_stale_votes(self.today()).await?;
        if purged > 0 {
            info!(purged, "Purged votes for past travel dates");
        }
        Ok(purged)
    }

    // ========================================================================
    // Anomalies
    // ========================================================================

    /// Run the detection rules over recent activity and record new findings.
    pub async fn detect_anomalies(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        let snapshot = self
            .ledger
            .activity_since(now - Duration::days(anomaly::LOOKBACK_DAYS), now.date_naive())
            .await?;

        let open: HashSet<(Uuid, &'static str)> = self
            .ledger
            .list_anomalies(&AnomalyFilter::Unreviewed)
            .await?
            .iter()
            .map(|a| (a.user_id, a.kind.tag()))
            .collect();

        let findings = anomaly::evaluate(&snapshot, &self.policy.anomaly_rules, &open, now);
        if findings.is_empty() {
            debug!("No new anomalies");
            return Ok(0);
        }

        let recorded = self.ledger.record_anomalies(findings).await?;
        info!(recorded, "Recorded anomalies");
        Ok(recorded)
    }

    pub async fn list_anomalies(&self, filter: &AnomalyFilter) -> CoreResult<Vec<Anomaly>> {
        self.ledger.list_anomalies(filter).await
    }

    pub async fn review_anomaly(&self, id: Uuid, reviewer: &Actor) -> CoreResult<Anomaly> {
        let anomaly = self.ledger.review_anomaly(id, reviewer.id, self.clock.now()).await?;
        info!(target: "audit", actor_id = %reviewer.id, action = "review_anomaly", anomaly_id = %id);
        Ok(anomaly)
    }
}
