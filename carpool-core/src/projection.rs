//! Role-specific queue views derived from ledger rows.
//!
//! Passengers see names, drivers see phone numbers and boarding state. Neither sees the
//! other's field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use carpool_shared::Masked;

use crate::models::{Arrival, PassengerProfile, Reservation, ReservationStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViewerRole {
    Passenger,
    Driver,
}

/// One active reservation joined with what the projections need.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub reservation: Reservation,
    pub profile: Option<PassengerProfile>,
    pub arrival: Option<Arrival>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassengerQueueEntry {
    pub position: u32,
    pub order_number: u32,
    pub status: ReservationStatus,
    pub passenger_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverQueueEntry {
    pub position: u32,
    pub reservation_id: Uuid,
    pub order_number: u32,
    pub status: ReservationStatus,
    pub passenger_phone: Option<Masked<String>>,
    pub arrived: bool,
    pub arrival_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "view", content = "entries", rename_all = "snake_case")]
pub enum QueueView {
    Passenger(Vec<PassengerQueueEntry>),
    Driver(Vec<DriverQueueEntry>),
}

impl QueueView {
    pub fn len(&self) -> usize {
        match self {
            QueueView::Passenger(entries) => entries.len(),
            QueueView::Driver(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn order_numbers(&self) -> Vec<u32> {
        match self {
            QueueView::Passenger(entries) => entries.iter().map(|e| e.order_number).collect(),
            QueueView::Driver(entries) => entries.iter().map(|e| e.order_number).collect(),
        }
    }
}

/// Filter to active rows, order by order number and project for `role`.
pub fn build(mut rows: Vec<QueueRow>, role: ViewerRole) -> QueueView {
    rows.retain(|row| row.reservation.status.is_active());
    rows.sort_by_key(|row| row.reservation.order_number);

    let positioned = rows.into_iter().zip(1u32..);
    match role {
        ViewerRole::Passenger => QueueView::Passenger(
            positioned
                .map(|(row, position)| PassengerQueueEntry {
                    position,
                    order_number: row.reservation.order_number,
                    status: row.reservation.status,
                    passenger_name: row.profile.map(|p| p.name).unwrap_or_default(),
                })
                .collect(),
        ),
        ViewerRole::Driver => QueueView::Driver(
            positioned
                .map(|(row, position)| {
                    let (arrived, arrival_time) = row
                        .arrival
                        .map(|a| (a.arrived, a.arrival_time))
                        .unwrap_or((false, None));
                    DriverQueueEntry {
                        position,
                        reservation_id: row.reservation.id,
                        order_number: row.reservation.order_number,
                        status: row.reservation.status,
                        passenger_phone: row.profile.and_then(|p| p.phone),
                        arrived,
                        arrival_time,
                    }
                })
                .collect(),
        ),
    }
}
