use chrono::{DateTime, Utc};

use crate::error::{CoreError, CoreResult};
use crate::models::{Actor, Arrival, Car, Reservation, ReservationStatus, Role};

/// Drivers may only mark passengers of their own car. Unassigned cars accept any driver.
pub fn authorize(car: &Car, actor: &Actor) -> CoreResult<()> {
    let allowed = match actor.role {
        Role::Admin => true,
        Role::Driver => car.driver_id.map(|driver| driver == actor.id).unwrap_or(true),
        Role::Passenger | Role::Owner => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(CoreError::Forbidden { actor_id: actor.id, action: "mark arrivals for this car" })
    }
}

pub fn check(reservation: &Reservation) -> CoreResult<()> {
    if reservation.status != ReservationStatus::Confirmed {
        return Err(CoreError::NotConfirmed(reservation.id));
    }
    Ok(())
}

/// The row to upsert. `arrival_time` is only kept while `arrived` is true.
pub fn record(reservation: &Reservation, arrived: bool, actor: &Actor, now: DateTime<Utc>) -> Arrival {
    Arrival {
        reservation_id: reservation.id,
        arrived,
        arrival_time: arrived.then_some(now),
        actor_id: actor.id,
        updated_at: now,
    }
}
