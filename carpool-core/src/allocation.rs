//! Seat admission rule.
//!
//! Every ledger backend evaluates this inside its per-car serialized section, after
//! reading the passenger's active state and the car's seat accounting.

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::Car;

/// What the ledger observed for one `reserve_seat` call, under lock.
#[derive(Debug, Clone, Copy)]
pub struct SeatSnapshot {
    pub passenger_has_active: bool,
    pub active_count: u32,
    /// Highest order number ever handed out for the car (0 if none).
    pub highest_order_number: u32,
}

/// Outcome of a successful `reserve_seat`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SeatReservation {
    pub reservation_id: Uuid,
    pub order_number: u32,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Check the preconditions in order and return the order number to assign.
///
/// Order numbers keep increasing per car and are never reused. Without cancellations
/// this equals the active count plus one.
pub fn admit(car: &Car, passenger_id: Uuid, snapshot: SeatSnapshot) -> CoreResult<u32> {
    if snapshot.passenger_has_active {
        return Err(CoreError::AlreadyReserved(passenger_id));
    }

    if snapshot.active_count >= car.capacity {
        return Err(CoreError::CarFull(car.id));
    }

    let order_number = snapshot.highest_order_number.max(snapshot.active_count) + 1;
    Ok(order_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn car(capacity: u32) -> Car {
        Car {
            id: Uuid::new_v4(),
            title: "Cairo-Alex 1".to_string(),
            capacity,
            route: Some("Cairo-Alex".to_string()),
            driver_id: None,
            created_at: Utc::now(),
        }
    }

    fn snapshot(passenger_has_active: bool, active_count: u32, highest_order_number: u32) -> SeatSnapshot {
        SeatSnapshot { passenger_has_active, active_count, highest_order_number }
    }

    #[test]
    fn test_first_seat_gets_order_one() {
        let car = car(14);
        assert_eq!(admit(&car, Uuid::new_v4(), snapshot(false, 0, 0)).unwrap(), 1);
    }

    #[test]
    fn test_active_passenger_is_checked_before_capacity() {
        let car = car(1);
        let passenger = Uuid::new_v4();
        let result = admit(&car, passenger, snapshot(true, 1, 1));
        assert_eq!(result, Err(CoreError::AlreadyReserved(passenger)));
    }

    #[test]
    fn test_full_car_rejects() {
        let car = car(14);
        let result = admit(&car, Uuid::new_v4(), snapshot(false, 14, 14));
        assert_eq!(result, Err(CoreError::CarFull(car.id)));
    }

    #[test]
    fn test_cancelled_numbers_are_not_reused() {
        // Three seats handed out, #2 cancelled: the next passenger is #4, not #3 or #2.
        let car = car(14);
        assert_eq!(admit(&car, Uuid::new_v4(), snapshot(false, 2, 3)).unwrap(), 4);
    }
}
