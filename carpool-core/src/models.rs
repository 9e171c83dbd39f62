use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, Utc};
use carpool_shared::Masked;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Reservation status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Temporary,
    Confirmed,
    Cancelled,
    Rejected,
    Completed,
}

impl ReservationStatus {
    /// Active reservations occupy a seat.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Temporary | ReservationStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Temporary => "temporary",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporary" => Ok(ReservationStatus::Temporary),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            "rejected" => Ok(ReservationStatus::Rejected),
            "completed" => Ok(ReservationStatus::Completed),
            other => Err(CoreError::Integrity(format!("unknown reservation status '{}'", other))),
        }
    }
}

/// Role of the authenticated caller, supplied by the auth layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Passenger,
    Driver,
    Admin,
    Owner,
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passenger" => Ok(Role::Passenger),
            "driver" => Ok(Role::Driver),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(CoreError::Validation(format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Uuid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A fixed-capacity vehicle; the capacity root for reservations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Car {
    pub id: Uuid,
    pub title: String,
    pub capacity: u32,
    pub route: Option<String>,
    pub driver_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCar {
    pub title: String,
    pub capacity: u32,
    pub route: Option<String>,
    pub driver_id: Option<Uuid>,
}

/// A car plus its derived seat accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarAvailability {
    #[serde(flatten)]
    pub car: Car,
    pub active_count: u32,
    pub available_seats: u32,
}

impl CarAvailability {
    pub fn new(car: Car, active_count: u32) -> Self {
        let available_seats = car.capacity.saturating_sub(active_count);
        Self { car, active_count, available_seats }
    }
}

/// Display data for a passenger, mirrored from the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassengerProfile {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<Masked<String>>,
}

/// The central ledger entity. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    pub id: Uuid,
    pub car_id: Uuid,
    pub passenger_id: Uuid,
    pub order_number: u32,
    pub status: ReservationStatus,
    pub low_confidence: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new_hold(
        car_id: Uuid,
        passenger_id: Uuid,
        order_number: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            car_id,
            passenger_id,
            order_number,
            status: ReservationStatus::Temporary,
            low_confidence: false,
            expires_at: Some(expires_at),
            created_at: now,
            updated_at: now,
        }
    }

    /// A hold whose deadline has passed. Inert once the status leaves `temporary`.
    pub fn is_expired_hold(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Temporary
            && self.expires_at.map(|deadline| deadline < now).unwrap_or(false)
    }
}

/// A reservation of any status with the passenger and car details the admin history shows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReservationDetails {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub passenger_name: Option<String>,
    pub passenger_phone: Option<Masked<String>>,
    pub car_title: String,
}

/// Fields the verifier managed to read off the receipt screenshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedFields {
    pub transaction_id: Option<String>,
    pub amount: Option<String>,
    pub from_phone: Option<String>,
    pub to_phone: Option<String>,
}

/// Payment evidence attached to a reservation (one per reservation).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub image_ref: String,
    pub ai_confidence: f64,
    pub ocr_text: String,
    pub extracted_fields: ExtractedFields,
    pub warnings: Vec<String>,
    pub admin_confirmed: Option<bool>,
    pub admin_id: Option<Uuid>,
    pub admin_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A payment awaiting admin review, joined with its reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPayment {
    pub payment: Payment,
    pub reservation: Reservation,
}

/// Boarding state of a confirmed reservation. Upserted, never appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Arrival {
    pub reservation_id: Uuid,
    pub arrived: bool,
    pub arrival_time: Option<DateTime<Utc>>,
    pub actor_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// A (route, travel date) vote group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VoteKey {
    pub route: String,
    pub travel_date: NaiveDate,
}

impl VoteKey {
    pub fn new(route: impl Into<String>, travel_date: NaiveDate) -> Self {
        Self { route: route.into().trim().to_string(), travel_date }
    }
}

impl fmt::Display for VoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.route, self.travel_date)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vote {
    pub id: Uuid,
    pub passenger_id: Uuid,
    pub route: String,
    pub travel_date: NaiveDate,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}
