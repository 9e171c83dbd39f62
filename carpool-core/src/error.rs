use uuid::Uuid;
use chrono::NaiveDate;

/// Domain error taxonomy.
///
/// Precondition failures are expected outcomes returned to the caller. `Contention` is a
/// benign race worth retrying. `Integrity` and `Internal` abort the unit of work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Passenger {0} already holds an active reservation")]
    AlreadyReserved(Uuid),

    #[error("Car {0} is full")]
    CarFull(Uuid),

    #[error("Passenger {passenger_id} already voted for {route} on {travel_date}")]
    AlreadyVoted {
        passenger_id: Uuid,
        route: String,
        travel_date: NaiveDate,
    },

    #[error("{entity} not found: {id}")]
    NotFound {
        entity: &'static str,
        id: String,
    },

    #[error("Reservation {0} is not temporary")]
    NotTemporary(Uuid),

    #[error("Reservation {0} is not confirmed")]
    NotConfirmed(Uuid),

    #[error("Reservation {0} cannot be cancelled")]
    NotCancellable(Uuid),

    #[error("Reservation {0} has no payment on file")]
    PaymentMissing(Uuid),

    #[error("No pending votes for {route} on {travel_date}")]
    NoPendingVotes {
        route: String,
        travel_date: NaiveDate,
    },

    #[error("Actor {actor_id} may not {action}")]
    Forbidden {
        actor_id: Uuid,
        action: &'static str,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Store contention: {0}")]
    Contention(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Internal service error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound { entity, id: id.to_string() }
    }

    /// Stable machine-readable code for the failure.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::AlreadyReserved(_) => "ALREADY_RESERVED",
            CoreError::CarFull(_) => "CAR_FULL",
            CoreError::AlreadyVoted { .. } => "ALREADY_VOTED",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::NotTemporary(_) => "NOT_TEMPORARY",
            CoreError::NotConfirmed(_) => "NOT_CONFIRMED",
            CoreError::NotCancellable(_) => "NOT_CANCELLABLE",
            CoreError::PaymentMissing(_) => "PAYMENT_MISSING",
            CoreError::NoPendingVotes { .. } => "NO_PENDING_VOTES",
            CoreError::Forbidden { .. } => "FORBIDDEN",
            CoreError::Validation(_) => "VALIDATION",
            CoreError::Contention(_) => "CONTENTION",
            CoreError::Integrity(_) => "INTEGRITY",
            CoreError::Internal(_) => "INTERNAL",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Contention(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
