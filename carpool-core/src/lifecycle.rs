//! Reservation state machine.
//!
//! ```text
//! temporary -> confirmed | rejected | cancelled
//! confirmed -> completed | cancelled
//! ```
//! Everything else is terminal.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use carpool_shared::models::events::QueueChange;

use crate::error::{CoreError, CoreResult};
use crate::models::{Actor, Reservation, ReservationStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Admin accepted the payment evidence.
    Confirm { admin_id: Uuid },
    /// Admin refused the payment evidence.
    Reject { admin_id: Uuid, note: Option<String> },
    /// Passenger self-cancel or administrative cancel.
    Cancel { actor: Actor },
    /// Sweeper timeout of an unconfirmed hold.
    Expire,
    /// Trip closure.
    Complete,
}

impl Transition {
    pub fn target(&self) -> ReservationStatus {
        match self {
            Transition::Confirm { .. } => ReservationStatus::Confirmed,
            Transition::Reject { .. } => ReservationStatus::Rejected,
            Transition::Cancel { .. } | Transition::Expire => ReservationStatus::Cancelled,
            Transition::Complete => ReservationStatus::Completed,
        }
    }

    pub fn change(&self) -> QueueChange {
        match self {
            Transition::Confirm { .. } => QueueChange::Confirmed,
            Transition::Reject { .. } => QueueChange::Rejected,
            Transition::Cancel { .. } => QueueChange::Cancelled,
            Transition::Expire => QueueChange::Expired,
            Transition::Complete => QueueChange::Completed,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Transition::Confirm { .. } => "confirm_reservation",
            Transition::Reject { .. } => "reject_reservation",
            Transition::Cancel { .. } => "cancel_reservation",
            Transition::Expire => "expire_hold",
            Transition::Complete => "complete_reservation",
        }
    }
}

/// Validate `transition` against the current row. `has_payment` is only consulted for confirmation.
pub fn check(
    reservation: &Reservation,
    transition: &Transition,
    has_payment: bool,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let id = reservation.id;
    match transition {
        Transition::Confirm { .. } => {
            if reservation.status != ReservationStatus::Temporary {
                return Err(CoreError::NotTemporary(id));
            }
            if !has_payment {
                return Err(CoreError::PaymentMissing(id));
            }
            Ok(())
        }
        Transition::Reject { .. } => {
            if reservation.status != ReservationStatus::Temporary {
                return Err(CoreError::NotTemporary(id));
            }
            Ok(())
        }
        Transition::Cancel { actor } => {
            if !actor.is_admin() && actor.id != reservation.passenger_id {
                return Err(CoreError::Forbidden {
                    actor_id: actor.id,
                    action: "cancel another passenger's reservation",
                });
            }
            if !reservation.status.is_active() {
                return Err(CoreError::NotCancellable(id));
            }
            Ok(())
        }
        Transition::Expire => {
            if reservation.status != ReservationStatus::Temporary {
                return Err(CoreError::NotTemporary(id));
            }
            if !reservation.is_expired_hold(now) {
                return Err(CoreError::Validation(format!("hold {} has not expired", id)));
            }
            Ok(())
        }
        Transition::Complete => {
            if reservation.status != ReservationStatus::Confirmed {
                return Err(CoreError::NotConfirmed(id));
            }
            Ok(())
        }
    }
}

/// Apply an already-checked transition. Leaving `temporary` clears the deadline.
pub fn apply(reservation: &mut Reservation, transition: &Transition, now: DateTime<Utc>) {
    reservation.status = transition.target();
    if reservation.status != ReservationStatus::Temporary {
        reservation.expires_at = None;
    }
    reservation.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::Duration;

    fn hold() -> Reservation {
        let now = Utc::now();
        Reservation::new_hold(Uuid::new_v4(), Uuid::new_v4(), 1, now, now + Duration::minutes(20))
    }

    #[test]
    fn test_confirm_then_complete() {
        let now = Utc::now();
        let mut reservation = hold();
        let confirm = Transition::Confirm { admin_id: Uuid::new_v4() };

        check(&reservation, &confirm, true, now).unwrap();
        apply(&mut reservation, &confirm, now);
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert!(reservation.expires_at.is_none());

        check(&reservation, &Transition::Complete, false, now).unwrap();
        apply(&mut reservation, &Transition::Complete, now);
        assert_eq!(reservation.status, ReservationStatus::Completed);
    }

    #[test]
    fn test_confirm_requires_payment() {
        let reservation = hold();
        let confirm = Transition::Confirm { admin_id: Uuid::new_v4() };
        assert_eq!(
            check(&reservation, &confirm, false, Utc::now()),
            Err(CoreError::PaymentMissing(reservation.id))
        );
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let now = Utc::now();
        let mut reservation = hold();
        apply(&mut reservation, &Transition::Reject { admin_id: Uuid::new_v4(), note: None }, now);

        let admin = Actor::new(Uuid::new_v4(), Role::Admin);
        assert_eq!(
            check(&reservation, &Transition::Confirm { admin_id: admin.id }, true, now),
            Err(CoreError::NotTemporary(reservation.id))
        );
        assert_eq!(
            check(&reservation, &Transition::Cancel { actor: admin }, false, now),
            Err(CoreError::NotCancellable(reservation.id))
        );
        assert_eq!(
            check(&reservation, &Transition::Complete, false, now),
            Err(CoreError::NotConfirmed(reservation.id))
        );
    }

    #[test]
    fn test_passenger_cannot_cancel_someone_else() {
        let reservation = hold();
        let stranger = Actor::new(Uuid::new_v4(), Role::Passenger);
        let result = check(&reservation, &Transition::Cancel { actor: stranger }, false, Utc::now());
        assert!(matches!(result, Err(CoreError::Forbidden { .. })));

        let owner = Actor::new(reservation.passenger_id, Role::Passenger);
        assert!(check(&reservation, &Transition::Cancel { actor: owner }, false, Utc::now()).is_ok());
    }

    #[test]
    fn test_confirmed_seat_can_be_cancelled() {
        let now = Utc::now();
        let mut reservation = hold();
        apply(&mut reservation, &Transition::Confirm { admin_id: Uuid::new_v4() }, now);

        let owner = Actor::new(reservation.passenger_id, Role::Passenger);
        assert!(check(&reservation, &Transition::Cancel { actor: owner }, false, now).is_ok());
    }

    #[test]
    fn test_expire_is_deadline_gated() {
        let reservation = hold();
        let created = reservation.created_at;
        assert!(check(&reservation, &Transition::Expire, false, created + Duration::minutes(5)).is_err());
        assert!(check(&reservation, &Transition::Expire, false, created + Duration::minutes(21)).is_ok());
    }
}
