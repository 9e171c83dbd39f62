//! Single-process ledger. One `RwLock` serializes every write, which covers the
//! per-car and per-vote-group serialization points.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::allocation::{self, SeatReservation, SeatSnapshot};
use crate::anomaly::{ActivitySnapshot, Anomaly, AnomalyFilter};
use crate::arrival;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::{self, Transition};
use crate::models::{
    Actor, Arrival, Car, CarAvailability, NewCar, PassengerProfile, Payment, PendingPayment, Reservation,
    ReservationDetails, ReservationStatus, Vote, VoteKey,
};
use crate::payment::{self, NewPayment};
use crate::projection::QueueRow;
use crate::repository::Ledger;
use crate::voting::{self, ExtraCar, VoteGroup};

#[derive(Default)]
struct State {
    cars: HashMap<Uuid, Car>,
    profiles: HashMap<Uuid, PassengerProfile>,
    reservations: HashMap<Uuid, Reservation>,
    /// Highest order number ever handed out, per car.
    order_high_water: HashMap<Uuid, u32>,
    /// Keyed by reservation id.
    payments: HashMap<Uuid, Payment>,
    arrivals: HashMap<Uuid, Arrival>,
    votes: Vec<Vote>,
    anomalies: Vec<Anomaly>,
}

impl State {
    fn active_count(&self, car_id: Uuid) -> u32 {
        self.reservations
            .values()
            .filter(|r| r.car_id == car_id && r.status.is_active())
            .count() as u32
    }

    fn active_for(&self, passenger_id: Uuid) -> Option<&Reservation> {
        self.reservations
            .values()
            .find(|r| r.passenger_id == passenger_id && r.status.is_active())
    }

    fn reservation_mut(&mut self, id: Uuid) -> CoreResult<&mut Reservation> {
        self.reservations
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("reservation", id))
    }

    fn unconsumed(&self, key: &VoteKey) -> u32 {
        self.votes
            .iter()
            .filter(|v| !v.consumed && v.route == key.route && v.travel_date == key.travel_date)
            .count() as u32
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_car(&self, car: NewCar, now: DateTime<Utc>) -> CoreResult<Car> {
        let car = Car {
            id: Uuid::new_v4(),
            title: car.title,
            capacity: car.capacity,
            route: car.route,
            driver_id: car.driver_id,
            created_at: now,
        };
        self.state.write().await.cars.insert(car.id, car.clone());
        Ok(car)
    }

    async fn get_car(&self, id: Uuid) -> CoreResult<Option<Car>> {
        Ok(self.state.read().await.cars.get(&id).cloned())
    }

    async fn list_cars(&self) -> CoreResult<Vec<CarAvailability>> {
        let state = self.state.read().await;
        let mut cars: Vec<CarAvailability> = state
            .cars
            .values()
            .map(|car| CarAvailability::new(car.clone(), state.active_count(car.id)))
            .collect();
        cars.sort_by(|a, b| a.car.created_at.cmp(&b.car.created_at).then_with(|| a.car.title.cmp(&b.car.title)));
        Ok(cars)
    }

    async fn upsert_profile(&self, profile: PassengerProfile) -> CoreResult<()> {
        self.state.write().await.profiles.insert(profile.id, profile);
        Ok(())
    }

    async fn reserve_seat(
        &self,
        car_id: Uuid,
        passenger_id: Uuid,
        now: DateTime<Utc>,
        hold: Duration,
    ) -> CoreResult<SeatReservation> {
        let mut state = self.state.write().await;
        let car = state
            .cars
            .get(&car_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("car", car_id))?;

        let snapshot = SeatSnapshot {
            passenger_has_active: state.active_for(passenger_id).is_some(),
            active_count: state.active_count(car_id),
            highest_order_number: state.order_high_water.get(&car_id).copied().unwrap_or(0),
        };
        let order_number = allocation::admit(&car, passenger_id, snapshot)?;

        let reservation = Reservation::new_hold(car_id, passenger_id, order_number, now, now + hold);
        let seat = SeatReservation {
            reservation_id: reservation.id,
            order_number,
            expires_at: now + hold,
        };
        state.order_high_water.insert(car_id, order_number);
        state.reservations.insert(reservation.id, reservation);
        Ok(seat)
    }

    async fn get_reservation(&self, id: Uuid) -> CoreResult<Option<Reservation>> {
        Ok(self.state.read().await.reservations.get(&id).cloned())
    }

    async fn active_reservation(&self, passenger_id: Uuid) -> CoreResult<Option<Reservation>> {
        Ok(self.state.read().await.active_for(passenger_id).cloned())
    }

    async fn list_reservations(&self, limit: u32) -> CoreResult<Vec<ReservationDetails>> {
        let state = self.state.read().await;
        let mut reservations: Vec<&Reservation> = state.reservations.values().collect();
        reservations.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.order_number.cmp(&a.order_number))
        });

        reservations
            .into_iter()
            .take(limit as usize)
            .map(|r| {
                let car = state
                    .cars
                    .get(&r.car_id)
                    .ok_or_else(|| CoreError::Integrity(format!("reservation {} references a missing car", r.id)))?;
                let profile = state.profiles.get(&r.passenger_id);
                Ok(ReservationDetails {
                    reservation: r.clone(),
                    passenger_name: profile.map(|p| p.name.clone()),
                    passenger_phone: profile.and_then(|p| p.phone.clone()),
                    car_title: car.title.clone(),
                })
            })
            .collect()
    }

    async fn attach_payment(
        &self,
        new_payment: NewPayment,
        actor: Actor,
        low_confidence: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<(Reservation, Payment)> {
        let mut state = self.state.write().await;
        let reservation_id = new_payment.reservation_id;
        payment::check_submission(state.reservation_mut(reservation_id)?, &actor)?;

        let existing_id = state.payments.get(&reservation_id).map(|p| p.id);
        let stored = new_payment.into_payment(existing_id, now);
        state.payments.insert(reservation_id, stored.clone());

        let reservation = state.reservation_mut(reservation_id)?;
        reservation.low_confidence = low_confidence;
        reservation.updated_at = now;
        Ok((reservation.clone(), stored))
    }

    async fn get_payment(&self, reservation_id: Uuid) -> CoreResult<Option<Payment>> {
        Ok(self.state.read().await.payments.get(&reservation_id).cloned())
    }

    async fn pending_payments(&self) -> CoreResult<Vec<PendingPayment>> {
        let state = self.state.read().await;
        let mut pending: Vec<PendingPayment> = state
            .payments
            .values()
            .filter(|p| p.admin_confirmed.is_none())
            .filter_map(|p| {
                let reservation = state.reservations.get(&p.reservation_id)?;
                (reservation.status == ReservationStatus::Temporary).then(|| PendingPayment {
                    payment: p.clone(),
                    reservation: reservation.clone(),
                })
            })
            .collect();
        pending.sort_by(|a, b| {
            b.reservation
                .low_confidence
                .cmp(&a.reservation.low_confidence)
                .then(a.payment.created_at.cmp(&b.payment.created_at))
        });
        Ok(pending)
    }

    async fn transition(&self, id: Uuid, transition: Transition, now: DateTime<Utc>) -> CoreResult<Reservation> {
        let mut state = self.state.write().await;
        let has_payment = state.payments.contains_key(&id);
        let reservation = state.reservation_mut(id)?;
        lifecycle::check(reservation, &transition, has_payment, now)?;
        lifecycle::apply(reservation, &transition, now);
        let updated = reservation.clone();

        if let Some(payment) = state.payments.get_mut(&id) {
            match &transition {
                Transition::Confirm { admin_id } => {
                    payment.admin_confirmed = Some(true);
                    payment.admin_id = Some(*admin_id);
                }
                Transition::Reject { admin_id, note } => {
                    payment.admin_confirmed = Some(false);
                    payment.admin_id = Some(*admin_id);
                    payment.admin_note = note.clone();
                }
                _ => {}
            }
        }
        Ok(updated)
    }

    async fn expired_holds(&self, now: DateTime<Utc>) -> CoreResult<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut expired: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.is_expired_hold(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }

    async fn expire_hold(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut state = self.state.write().await;
        let reservation = state.reservation_mut(id)?;
        if !reservation.is_expired_hold(now) {
            return Ok(false);
        }
        lifecycle::apply(reservation, &Transition::Expire, now);
        Ok(true)
    }

    async fn queue_rows(&self, car_id: Uuid) -> CoreResult<Vec<QueueRow>> {
        let state = self.state.read().await;
        if !state.cars.contains_key(&car_id) {
            return Err(CoreError::not_found("car", car_id));
        }
        Ok(state
            .reservations
            .values()
            .filter(|r| r.car_id == car_id && r.status.is_active())
            .map(|r| QueueRow {
                reservation: r.clone(),
                profile: state.profiles.get(&r.passenger_id).cloned(),
                arrival: state.arrivals.get(&r.id).cloned(),
            })
            .collect())
    }

    async fn mark_arrival(
        &self,
        reservation_id: Uuid,
        arrived: bool,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> CoreResult<(Reservation, Arrival)> {
        let mut state = self.state.write().await;
        let reservation = state
            .reservations
            .get(&reservation_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("reservation", reservation_id))?;
        let car = state
            .cars
            .get(&reservation.car_id)
            .ok_or_else(|| CoreError::Integrity(format!("reservation {} references a missing car", reservation_id)))?;
        arrival::authorize(car, &actor)?;
        arrival::check(&reservation)?;

        let row = arrival::record(&reservation, arrived, &actor, now);
        state.arrivals.insert(reservation_id, row.clone());
        Ok((reservation, row))
    }

    async fn get_arrival(&self, reservation_id: Uuid) -> CoreResult<Option<Arrival>> {
        Ok(self.state.read().await.arrivals.get(&reservation_id).cloned())
    }

    async fn cast_vote(&self, key: &VoteKey, passenger_id: Uuid, now: DateTime<Utc>) -> CoreResult<u32> {
        let mut state = self.state.write().await;
        let duplicate = state
            .votes
            .iter()
            .any(|v| v.passenger_id == passenger_id && v.route == key.route && v.travel_date == key.travel_date);
        if duplicate {
            return Err(CoreError::AlreadyVoted {
                passenger_id,
                route: key.route.clone(),
                travel_date: key.travel_date,
            });
        }
        state.votes.push(Vote {
            id: Uuid::new_v4(),
            passenger_id,
            route: key.route.clone(),
            travel_date: key.travel_date,
            consumed: false,
            created_at: now,
        });
        Ok(state.unconsumed(key))
    }

    async fn unconsumed_votes(&self, key: &VoteKey) -> CoreResult<u32> {
        Ok(self.state.read().await.unconsumed(key))
    }

    async fn pending_vote_groups(&self, from: NaiveDate) -> CoreResult<Vec<VoteGroup>> {
        let state = self.state.read().await;
        let mut counts: HashMap<(&str, NaiveDate), u32> = HashMap::new();
        for vote in state.votes.iter().filter(|v| !v.consumed && v.travel_date >= from) {
            *counts.entry((vote.route.as_str(), vote.travel_date)).or_default() += 1;
        }
        let mut groups: Vec<VoteGroup> = counts
            .into_iter()
            .map(|((route, travel_date), votes_count)| VoteGroup {
                route: route.to_string(),
                travel_date,
                votes_count,
            })
            .collect();
        voting::sort_groups(&mut groups);
        Ok(groups)
    }

    async fn accept_extra_car(
        &self,
        key: &VoteKey,
        title: &str,
        standard_capacity: u32,
        now: DateTime<Utc>,
    ) -> CoreResult<(Car, ExtraCar)> {
        let mut state = self.state.write().await;
        let votes_count = state.unconsumed(key);
        if votes_count == 0 {
            return Err(CoreError::NoPendingVotes {
                route: key.route.clone(),
                travel_date: key.travel_date,
            });
        }

        let car = Car {
            id: Uuid::new_v4(),
            title: title.to_string(),
            capacity: voting::capacity_for_votes(votes_count, standard_capacity),
            route: Some(key.route.clone()),
            driver_id: None,
            created_at: now,
        };
        for vote in state
            .votes
            .iter_mut()
            .filter(|v| !v.consumed && v.route == key.route && v.travel_date == key.travel_date)
        {
            vote.consumed = true;
        }
        state.cars.insert(car.id, car.clone());

        let extra = ExtraCar { car_id: car.id, capacity: car.capacity, consumed_votes: votes_count };
        Ok((car, extra))
    }

    async fn purge_stale_votes(&self, today: NaiveDate) -> CoreResult<u64> {
        let mut state = self.state.write().await;
        let before = state.votes.len();
        state.votes.retain(|v| v.consumed || v.travel_date >= today);
        Ok((before - state.votes.len()) as u64)
    }

    async fn activity_since(&self, since: DateTime<Utc>, votes_from: NaiveDate) -> CoreResult<ActivitySnapshot> {
        let state = self.state.read().await;
        Ok(ActivitySnapshot {
            reservations: state
                .reservations
                .values()
                .filter(|r| r.created_at >= since)
                .cloned()
                .collect(),
            votes: state
                .votes
                .iter()
                .filter(|v| v.travel_date >= votes_from)
                .cloned()
                .collect(),
        })
    }

    async fn record_anomalies(&self, anomalies: Vec<Anomaly>) -> CoreResult<usize> {
        let count = anomalies.len();
        self.state.write().await.anomalies.extend(anomalies);
        Ok(count)
    }

    async fn list_anomalies(&self, filter: &AnomalyFilter) -> CoreResult<Vec<Anomaly>> {
        let state = self.state.read().await;
        let mut anomalies: Vec<Anomaly> = state.anomalies.iter().filter(|a| filter.matches(a)).cloned().collect();
        anomalies.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(anomalies)
    }

    async fn review_anomaly(&self, id: Uuid, reviewer: Uuid, now: DateTime<Utc>) -> CoreResult<Anomaly> {
        let mut state = self.state.write().await;
        let anomaly = state
            .anomalies
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| CoreError::not_found("anomaly", id))?;
        anomaly.reviewed = true;
        anomaly.reviewed_by = Some(reviewer);
        anomaly.reviewed_at = Some(now);
        Ok(anomaly.clone())
    }
}
