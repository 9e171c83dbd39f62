//! Postgres ledger.
//!
//! Seat allocation takes a transaction-scoped advisory lock on the passenger and then
//! `SELECT ... FOR UPDATE` on the car row, always in that order. Vote casting and
//! acceptance share an advisory lock per (route, travel date) group. Every transaction
//! sets `lock_timeout` so a stuck lock surfaces as contention instead of a hang.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use carpool_core::allocation::{self, SeatReservation, SeatSnapshot};
use carpool_core::anomaly::{ActivitySnapshot, Anomaly, AnomalyFilter, AnomalyKind};
use carpool_core::arrival;
use carpool_core::lifecycle::{self, Transition};
use carpool_core::models::{
    Actor, Arrival, Car, CarAvailability, ExtractedFields, NewCar, PassengerProfile, Payment, PendingPayment,
    Reservation, ReservationDetails, Vote, VoteKey,
};
use carpool_core::payment::{self, NewPayment};
use carpool_core::projection::QueueRow;
use carpool_core::voting::{self, ExtraCar, VoteGroup};
use carpool_core::{CoreError, CoreResult, Ledger};
use carpool_shared::Masked;

use crate::error::DbResultExt;

const RESERVATION_COLUMNS: &str =
    "id, car_id, passenger_id, order_number, status, low_confidence, expires_at, created_at, updated_at";
const PAYMENT_COLUMNS: &str = "id, reservation_id, image_ref, ai_confidence, ocr_text, extracted_fields, warnings, \
     admin_confirmed, admin_id, admin_note, created_at";
const ANOMALY_COLUMNS: &str =
    "id, user_id, user_id_hashed, details, score, reviewed, reviewed_by, reviewed_at, created_at";

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct CarRow {
    id: Uuid,
    title: String,
    capacity: i32,
    route: Option<String>,
    driver_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CarRow> for Car {
    type Error = CoreError;

    fn try_from(row: CarRow) -> CoreResult<Self> {
        Ok(Car {
            id: row.id,
            title: row.title,
            capacity: non_negative(row.capacity, "capacity")?,
            route: row.route,
            driver_id: row.driver_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CarAvailabilityRow {
    #[sqlx(flatten)]
    car: CarRow,
    active_count: i64,
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    id: Uuid,
    car_id: Uuid,
    passenger_id: Uuid,
    order_number: i32,
    status: String,
    low_confidence: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = CoreError;

    fn try_from(row: ReservationRow) -> CoreResult<Self> {
        Ok(Reservation {
            id: row.id,
            car_id: row.car_id,
            passenger_id: row.passenger_id,
            order_number: non_negative(row.order_number, "order_number")?,
            status: row.status.parse()?,
            low_confidence: row.low_confidence,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    reservation_id: Uuid,
    image_ref: String,
    ai_confidence: f64,
    ocr_text: String,
    extracted_fields: Json<ExtractedFields>,
    warnings: Json<Vec<String>>,
    admin_confirmed: Option<bool>,
    admin_id: Option<Uuid>,
    admin_note: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            id: row.id,
            reservation_id: row.reservation_id,
            image_ref: row.image_ref,
            ai_confidence: row.ai_confidence,
            ocr_text: row.ocr_text,
            extracted_fields: row.extracted_fields.0,
            warnings: row.warnings.0,
            admin_confirmed: row.admin_confirmed,
            admin_id: row.admin_id,
            admin_note: row.admin_note,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArrivalRow {
    reservation_id: Uuid,
    arrived: bool,
    arrival_time: Option<DateTime<Utc>>,
    actor_id: Uuid,
    updated_at: DateTime<Utc>,
}

impl From<ArrivalRow> for Arrival {
    fn from(row: ArrivalRow) -> Self {
        Arrival {
            reservation_id: row.reservation_id,
            arrived: row.arrived,
            arrival_time: row.arrival_time,
            actor_id: row.actor_id,
            updated_at: row.updated_at,
        }
    }
}

/// Active reservation joined with the passenger profile and arrival row.
#[derive(sqlx::FromRow)]
struct QueueJoinRow {
    #[sqlx(flatten)]
    reservation: ReservationRow,
    profile_name: Option<String>,
    profile_phone: Option<String>,
    arrived: Option<bool>,
    arrival_time: Option<DateTime<Utc>>,
    arrival_actor_id: Option<Uuid>,
    arrival_updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<QueueJoinRow> for QueueRow {
    type Error = CoreError;

    fn try_from(row: QueueJoinRow) -> CoreResult<Self> {
        let reservation = Reservation::try_from(row.reservation)?;
        let profile = row.profile_name.map(|name| PassengerProfile {
            id: reservation.passenger_id,
            name,
            phone: row.profile_phone.map(Masked::new),
        });
        let arrival = match (row.arrived, row.arrival_actor_id, row.arrival_updated_at) {
            (Some(arrived), Some(actor_id), Some(updated_at)) => Some(Arrival {
                reservation_id: reservation.id,
                arrived,
                arrival_time: row.arrival_time,
                actor_id,
                updated_at,
            }),
            _ => None,
        };
        Ok(QueueRow { reservation, profile, arrival })
    }
}

/// Any reservation joined with its passenger profile and car title.
#[derive(sqlx::FromRow)]
struct HistoryJoinRow {
    #[sqlx(flatten)]
    reservation: ReservationRow,
    profile_name: Option<String>,
    profile_phone: Option<String>,
    car_title: String,
}

impl TryFrom<HistoryJoinRow> for ReservationDetails {
    type Error = CoreError;

    fn try_from(row: HistoryJoinRow) -> CoreResult<Self> {
        Ok(ReservationDetails {
            reservation: Reservation::try_from(row.reservation)?,
            passenger_name: row.profile_name,
            passenger_phone: row.profile_phone.map(Masked::new),
            car_title: row.car_title,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VoteRow {
    id: Uuid,
    passenger_id: Uuid,
    route: String,
    travel_date: NaiveDate,
    consumed: bool,
    created_at: DateTime<Utc>,
}

impl From<VoteRow> for Vote {
    fn from(row: VoteRow) -> Self {
        Vote {
            id: row.id,
            passenger_id: row.passenger_id,
            route: row.route,
            travel_date: row.travel_date,
            consumed: row.consumed,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VoteGroupRow {
    route: String,
    travel_date: NaiveDate,
    votes_count: i64,
}

#[derive(sqlx::FromRow)]
struct AnomalyRow {
    id: Uuid,
    user_id: Uuid,
    user_id_hashed: String,
    details: Json<AnomalyKind>,
    score: f64,
    reviewed: bool,
    reviewed_by: Option<Uuid>,
    reviewed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<AnomalyRow> for Anomaly {
    fn from(row: AnomalyRow) -> Self {
        Anomaly {
            id: row.id,
            user_id: row.user_id,
            user_id_hashed: row.user_id_hashed,
            kind: row.details.0,
            score: row.score,
            reviewed: row.reviewed,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            created_at: row.created_at,
        }
    }
}

fn non_negative(value: i32, column: &str) -> CoreResult<u32> {
    u32::try_from(value).map_err(|_| CoreError::Integrity(format!("negative {}: {}", column, value)))
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Advisory lock key for a named serialization point.
fn lock_key(namespace: &str, value: &str) -> i64 {
    let digest = Sha256::digest(format!("{}:{}", namespace, value).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

// ============================================================================
// Ledger
// ============================================================================

pub struct PgLedger {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgLedger {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self { pool, lock_timeout_ms }
    }

    async fn begin(&self) -> CoreResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.db()?;
        // SET does not take bind parameters.
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await
            .db()?;
        Ok(tx)
    }

    async fn advisory_lock(tx: &mut Transaction<'_, Postgres>, key: i64) -> CoreResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut **tx)
            .await
            .db()?;
        Ok(())
    }

    async fn lock_reservation(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> CoreResult<Reservation> {
        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reservations WHERE id = $1 FOR UPDATE",
            RESERVATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .db()?;
        row.ok_or_else(|| CoreError::not_found("reservation", id))?.try_into()
    }

    async fn fetch_car(tx: &mut Transaction<'_, Postgres>, id: Uuid, for_update: bool) -> CoreResult<Car> {
        let sql = if for_update {
            "SELECT id, title, capacity, route, driver_id, created_at FROM cars WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT id, title, capacity, route, driver_id, created_at FROM cars WHERE id = $1"
        };
        let row: Option<CarRow> = sqlx::query_as(sql).bind(id).fetch_optional(&mut **tx).await.db()?;
        row.ok_or_else(|| CoreError::not_found("car", id))?.try_into()
    }

    async fn insert_car(tx: &mut Transaction<'_, Postgres>, car: &Car) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cars (id, title, capacity, route, driver_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(car.id)
        .bind(&car.title)
        .bind(car.capacity as i32)
        .bind(&car.route)
        .bind(car.driver_id)
        .bind(car.created_at)
        .execute(&mut **tx)
        .await
        .db()?;
        Ok(())
    }

    async fn unconsumed_in_tx(tx: &mut Transaction<'_, Postgres>, key: &VoteKey) -> CoreResult<u32> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM votes_for_extra_cars WHERE route = $1 AND travel_date = $2 AND NOT consumed",
        )
        .bind(&key.route)
        .bind(key.travel_date)
        .fetch_one(&mut **tx)
        .await
        .db()?;
        Ok(count(n))
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn create_car(&self, car: NewCar, now: DateTime<Utc>) -> CoreResult<Car> {
        let car = Car {
            id: Uuid::new_v4(),
            title: car.title,
            capacity: car.capacity,
            route: car.route,
            driver_id: car.driver_id,
            created_at: now,
        };
        let mut tx = self.begin().await?;
        Self::insert_car(&mut tx, &car).await?;
        tx.commit().await.db()?;
        Ok(car)
    }

    async fn get_car(&self, id: Uuid) -> CoreResult<Option<Car>> {
        let row: Option<CarRow> =
            sqlx::query_as("SELECT id, title, capacity, route, driver_id, created_at FROM cars WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .db()?;
        row.map(Car::try_from).transpose()
    }

    async fn list_cars(&self) -> CoreResult<Vec<CarAvailability>> {
        let rows: Vec<CarAvailabilityRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.title, c.capacity, c.route, c.driver_id, c.created_at,
                   COUNT(r.id) FILTER (WHERE r.status IN ('temporary', 'confirmed')) AS active_count
            FROM cars c
            LEFT JOIN reservations r ON r.car_id = c.id
            GROUP BY c.id
            ORDER BY c.created_at, c.title
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .db()?;

        rows.into_iter()
            .map(|row| Ok(CarAvailability::new(Car::try_from(row.car)?, count(row.active_count))))
            .collect()
    }

    async fn upsert_profile(&self, profile: PassengerProfile) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, name, phone, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, phone = EXCLUDED.phone, updated_at = NOW()
            "#,
        )
        .bind(profile.id)
        .bind(&profile.name)
        .bind(profile.phone.map(Masked::into_inner))
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn reserve_seat(
        &self,
        car_id: Uuid,
        passenger_id: Uuid,
        now: DateTime<Utc>,
        hold: Duration,
    ) -> CoreResult<SeatReservation> {
        let mut tx = self.begin().await?;
        Self::advisory_lock(&mut tx, lock_key("passenger", &passenger_id.to_string())).await?;
        let car = Self::fetch_car(&mut tx, car_id, true).await?;

        let (passenger_has_active,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM reservations
                WHERE passenger_id = $1 AND status IN ('temporary', 'confirmed')
            )
            "#,
        )
        .bind(passenger_id)
        .fetch_one(&mut *tx)
        .await
        .db()?;

        let (active_count, highest): (i64, i32) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status IN ('temporary', 'confirmed')),
                   COALESCE(MAX(order_number), 0)
            FROM reservations
            WHERE car_id = $1
            "#,
        )
        .bind(car_id)
        .fetch_one(&mut *tx)
        .await
        .db()?;

        let snapshot = SeatSnapshot {
            passenger_has_active,
            active_count: count(active_count),
            highest_order_number: non_negative(highest, "order_number")?,
        };
        let order_number = allocation::admit(&car, passenger_id, snapshot)?;
        let reservation = Reservation::new_hold(car_id, passenger_id, order_number, now, now + hold);

        sqlx::query(
            r#"
            INSERT INTO reservations
                (id, car_id, passenger_id, order_number, status, low_confidence, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7, $7)
            "#,
        )
        .bind(reservation.id)
        .bind(car_id)
        .bind(passenger_id)
        .bind(order_number as i32)
        .bind(reservation.status.as_str())
        .bind(reservation.expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .db()?;

        tx.commit().await.db()?;
        debug!(car_id = %car_id, order_number, "Seat admitted");

        Ok(SeatReservation {
            reservation_id: reservation.id,
            order_number,
            expires_at: now + hold,
        })
    }

    async fn get_reservation(&self, id: Uuid) -> CoreResult<Option<Reservation>> {
        let row: Option<ReservationRow> =
            sqlx::query_as(&format!("SELECT {} FROM reservations WHERE id = $1", RESERVATION_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .db()?;
        row.map(Reservation::try_from).transpose()
    }

    async fn active_reservation(&self, passenger_id: Uuid) -> CoreResult<Option<Reservation>> {
        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reservations WHERE passenger_id = $1 AND status IN ('temporary', 'confirmed')",
            RESERVATION_COLUMNS
        ))
        .bind(passenger_id)
        .fetch_optional(&self.pool)
        .await
        .db()?;
        row.map(Reservation::try_from).transpose()
    }

    async fn list_reservations(&self, limit: u32) -> CoreResult<Vec<ReservationDetails>> {
        let rows: Vec<HistoryJoinRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.car_id, r.passenger_id, r.order_number, r.status, r.low_confidence,
                   r.expires_at, r.created_at, r.updated_at,
                   p.name AS profile_name, p.phone AS profile_phone,
                   c.title AS car_title
            FROM reservations r
            JOIN cars c ON c.id = r.car_id
            LEFT JOIN profiles p ON p.id = r.passenger_id
            ORDER BY r.created_at DESC, r.order_number DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .db()?;
        rows.into_iter().map(ReservationDetails::try_from).collect()
    }

    async fn attach_payment(
        &self,
        new_payment: NewPayment,
        actor: Actor,
        low_confidence: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<(Reservation, Payment)> {
        let mut tx = self.begin().await?;
        let mut reservation = Self::lock_reservation(&mut tx, new_payment.reservation_id).await?;
        payment::check_submission(&reservation, &actor)?;

        let existing: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM payments WHERE reservation_id = $1")
            .bind(reservation.id)
            .fetch_optional(&mut *tx)
            .await
            .db()?;
        let stored = new_payment.into_payment(existing.map(|(id,)| id), now);

        sqlx::query(
            r#"
            INSERT INTO payments
                (id, reservation_id, image_ref, ai_confidence, ocr_text, extracted_fields, warnings,
                 admin_confirmed, admin_id, admin_note, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, NULL, NULL, $8)
            ON CONFLICT (reservation_id) DO UPDATE
            SET image_ref = EXCLUDED.image_ref,
                ai_confidence = EXCLUDED.ai_confidence,
                ocr_text = EXCLUDED.ocr_text,
                extracted_fields = EXCLUDED.extracted_fields,
                warnings = EXCLUDED.warnings,
                admin_confirmed = NULL,
                admin_id = NULL,
                admin_note = NULL,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(stored.id)
        .bind(stored.reservation_id)
        .bind(&stored.image_ref)
        .bind(stored.ai_confidence)
        .bind(&stored.ocr_text)
        .bind(Json(&stored.extracted_fields))
        .bind(Json(&stored.warnings))
        .bind(stored.created_at)
        .execute(&mut *tx)
        .await
        .db()?;

        sqlx::query("UPDATE reservations SET low_confidence = $2, updated_at = $3 WHERE id = $1")
            .bind(reservation.id)
            .bind(low_confidence)
            .bind(now)
            .execute(&mut *tx)
            .await
            .db()?;

        tx.commit().await.db()?;
        reservation.low_confidence = low_confidence;
        reservation.updated_at = now;
        Ok((reservation, stored))
    }

    async fn get_payment(&self, reservation_id: Uuid) -> CoreResult<Option<Payment>> {
        let row: Option<PaymentRow> =
            sqlx::query_as(&format!("SELECT {} FROM payments WHERE reservation_id = $1", PAYMENT_COLUMNS))
                .bind(reservation_id)
                .fetch_optional(&self.pool)
                .await
                .db()?;
        Ok(row.map(Payment::from))
    }

    async fn pending_payments(&self) -> CoreResult<Vec<PendingPayment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.reservation_id, p.image_ref, p.ai_confidence, p.ocr_text, p.extracted_fields,
                   p.warnings, p.admin_confirmed, p.admin_id, p.admin_note, p.created_at
            FROM payments p
            JOIN reservations r ON r.id = p.reservation_id
            WHERE p.admin_confirmed IS NULL AND r.status = 'temporary'
            ORDER BY r.low_confidence DESC, p.created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .db()?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let payment = Payment::from(row);
            let reservation = self
                .get_reservation(payment.reservation_id)
                .await?
                .ok_or_else(|| CoreError::Integrity(format!("payment {} has no reservation", payment.id)))?;
            pending.push(PendingPayment { payment, reservation });
        }
        Ok(pending)
    }

    async fn transition(&self, id: Uuid, transition: Transition, now: DateTime<Utc>) -> CoreResult<Reservation> {
        let mut tx = self.begin().await?;
        let mut reservation = Self::lock_reservation(&mut tx, id).await?;

        let (has_payment,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM payments WHERE reservation_id = $1)")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .db()?;

        lifecycle::check(&reservation, &transition, has_payment, now)?;
        lifecycle::apply(&mut reservation, &transition, now);

        sqlx::query("UPDATE reservations SET status = $2, expires_at = $3, updated_at = $4 WHERE id = $1")
            .bind(id)
            .bind(reservation.status.as_str())
            .bind(reservation.expires_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .db()?;

        match &transition {
            Transition::Confirm { admin_id } => {
                sqlx::query("UPDATE payments SET admin_confirmed = TRUE, admin_id = $2 WHERE reservation_id = $1")
                    .bind(id)
                    .bind(admin_id)
                    .execute(&mut *tx)
                    .await
                    .db()?;
            }
            Transition::Reject { admin_id, note } => {
                sqlx::query(
                    "UPDATE payments SET admin_confirmed = FALSE, admin_id = $2, admin_note = $3 WHERE reservation_id = $1",
                )
                .bind(id)
                .bind(admin_id)
                .bind(note)
                .execute(&mut *tx)
                .await
                .db()?;
            }
            _ => {}
        }

        tx.commit().await.db()?;
        Ok(reservation)
    }

    async fn expired_holds(&self, now: DateTime<Utc>) -> CoreResult<Vec<Reservation>> {
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reservations WHERE status = 'temporary' AND expires_at < $1 ORDER BY expires_at",
            RESERVATION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .db()?;
        rows.into_iter().map(Reservation::try_from).collect()
    }

    async fn expire_hold(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<bool> {
        // The status predicate makes this a no-op for holds reviewed in the meantime.
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET status = 'cancelled', expires_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'temporary' AND expires_at < $2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(result.rows_affected() == 1)
    }

    async fn queue_rows(&self, car_id: Uuid) -> CoreResult<Vec<QueueRow>> {
        if self.get_car(car_id).await?.is_none() {
            return Err(CoreError::not_found("car", car_id));
        }

        let rows: Vec<QueueJoinRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.car_id, r.passenger_id, r.order_number, r.status, r.low_confidence,
                   r.expires_at, r.created_at, r.updated_at,
                   p.name AS profile_name, p.phone AS profile_phone,
                   a.arrived, a.arrival_time, a.actor_id AS arrival_actor_id, a.updated_at AS arrival_updated_at
            FROM reservations r
            LEFT JOIN profiles p ON p.id = r.passenger_id
            LEFT JOIN arrivals a ON a.reservation_id = r.id
            WHERE r.car_id = $1 AND r.status IN ('temporary', 'confirmed')
            ORDER BY r.order_number
            "#,
        )
        .bind(car_id)
        .fetch_all(&self.pool)
        .await
        .db()?;
        rows.into_iter().map(QueueRow::try_from).collect()
    }

    async fn mark_arrival(
        &self,
        reservation_id: Uuid,
        arrived: bool,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> CoreResult<(Reservation, Arrival)> {
        let mut tx = self.begin().await?;
        let reservation = Self::lock_reservation(&mut tx, reservation_id).await?;
        let car = Self::fetch_car(&mut tx, reservation.car_id, false).await?;
        arrival::authorize(&car, &actor)?;
        arrival::check(&reservation)?;

        let row = arrival::record(&reservation, arrived, &actor, now);
        sqlx::query(
            r#"
            INSERT INTO arrivals (reservation_id, arrived, arrival_time, actor_id, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (reservation_id) DO UPDATE
            SET arrived = EXCLUDED.arrived,
                arrival_time = EXCLUDED.arrival_time,
                actor_id = EXCLUDED.actor_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.reservation_id)
        .bind(row.arrived)
        .bind(row.arrival_time)
        .bind(row.actor_id)
        .bind(row.updated_at)
        .execute(&mut *tx)
        .await
        .db()?;

        tx.commit().await.db()?;
        Ok((reservation, row))
    }

    async fn get_arrival(&self, reservation_id: Uuid) -> CoreResult<Option<Arrival>> {
        let row: Option<ArrivalRow> = sqlx::query_as(
            "SELECT reservation_id, arrived, arrival_time, actor_id, updated_at FROM arrivals WHERE reservation_id = $1",
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
        .db()?;
        Ok(row.map(Arrival::from))
    }

    async fn cast_vote(&self, key: &VoteKey, passenger_id: Uuid, now: DateTime<Utc>) -> CoreResult<u32> {
        let mut tx = self.begin().await?;
        Self::advisory_lock(&mut tx, lock_key("votes", &key.to_string())).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO votes_for_extra_cars (id, passenger_id, route, travel_date, consumed, created_at)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            ON CONFLICT (passenger_id, route, travel_date) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(passenger_id)
        .bind(&key.route)
        .bind(key.travel_date)
        .bind(now)
        .execute(&mut *tx)
        .await
        .db()?;

        if inserted.rows_affected() == 0 {
            return Err(CoreError::AlreadyVoted {
                passenger_id,
                route: key.route.clone(),
                travel_date: key.travel_date,
            });
        }

        let votes = Self::unconsumed_in_tx(&mut tx, key).await?;
        tx.commit().await.db()?;
        Ok(votes)
    }

    async fn unconsumed_votes(&self, key: &VoteKey) -> CoreResult<u32> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM votes_for_extra_cars WHERE route = $1 AND travel_date = $2 AND NOT consumed",
        )
        .bind(&key.route)
        .bind(key.travel_date)
        .fetch_one(&self.pool)
        .await
        .db()?;
        Ok(count(n))
    }

    async fn pending_vote_groups(&self, from: NaiveDate) -> CoreResult<Vec<VoteGroup>> {
        let rows: Vec<VoteGroupRow> = sqlx::query_as(
            r#"
            SELECT route, travel_date, COUNT(*) AS votes_count
            FROM votes_for_extra_cars
            WHERE NOT consumed AND travel_date >= $1
            GROUP BY route, travel_date
            "#,
        )
        .bind(from)
        .fetch_all(&self.pool)
        .await
        .db()?;

        let mut groups: Vec<VoteGroup> = rows
            .into_iter()
            .map(|row| VoteGroup {
                route: row.route,
                travel_date: row.travel_date,
                votes_count: count(row.votes_count),
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
        let mut tx = self.begin().await?;
        Self::advisory_lock(&mut tx, lock_key("votes", &key.to_string())).await?;

        let votes_count = Self::unconsumed_in_tx(&mut tx, key).await?;
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
        Self::insert_car(&mut tx, &car).await?;

        let consumed = sqlx::query(
            "UPDATE votes_for_extra_cars SET consumed = TRUE WHERE route = $1 AND travel_date = $2 AND NOT consumed",
        )
        .bind(&key.route)
        .bind(key.travel_date)
        .execute(&mut *tx)
        .await
        .db()?;

        tx.commit().await.db()?;
        let extra = ExtraCar {
            car_id: car.id,
            capacity: car.capacity,
            consumed_votes: u32::try_from(consumed.rows_affected()).unwrap_or(votes_count),
        };
        Ok((car, extra))
    }

    async fn purge_stale_votes(&self, today: NaiveDate) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM votes_for_extra_cars WHERE NOT consumed AND travel_date < $1")
            .bind(today)
            .execute(&self.pool)
            .await
            .db()?;
        Ok(result.rows_affected())
    }

    async fn activity_since(&self, since: DateTime<Utc>, votes_from: NaiveDate) -> CoreResult<ActivitySnapshot> {
        let reservations: Vec<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM reservations WHERE created_at >= $1",
            RESERVATION_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .db()?;

        let votes: Vec<VoteRow> = sqlx::query_as(
            r#"
            SELECT id, passenger_id, route, travel_date, consumed, created_at
            FROM votes_for_extra_cars
            WHERE travel_date >= $1
            "#,
        )
        .bind(votes_from)
        .fetch_all(&self.pool)
        .await
        .db()?;

        Ok(ActivitySnapshot {
            reservations: reservations
                .into_iter()
                .map(Reservation::try_from)
                .collect::<CoreResult<Vec<_>>>()?,
            votes: votes.into_iter().map(Vote::from).collect(),
        })
    }

    async fn record_anomalies(&self, anomalies: Vec<Anomaly>) -> CoreResult<usize> {
        let mut tx = self.begin().await?;
        for anomaly in &anomalies {
            sqlx::query(
                r#"
                INSERT INTO anomalies
                    (id, user_id, user_id_hashed, kind, details, score, reviewed, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
                "#,
            )
            .bind(anomaly.id)
            .bind(anomaly.user_id)
            .bind(&anomaly.user_id_hashed)
            .bind(anomaly.kind.tag())
            .bind(Json(&anomaly.kind))
            .bind(anomaly.score)
            .bind(anomaly.created_at)
            .execute(&mut *tx)
            .await
            .db()?;
        }
        tx.commit().await.db()?;
        Ok(anomalies.len())
    }

    async fn list_anomalies(&self, filter: &AnomalyFilter) -> CoreResult<Vec<Anomaly>> {
        let query = match filter {
            AnomalyFilter::All => format!("SELECT {} FROM anomalies ORDER BY created_at DESC", ANOMALY_COLUMNS),
            AnomalyFilter::Unreviewed => format!(
                "SELECT {} FROM anomalies WHERE NOT reviewed ORDER BY created_at DESC",
                ANOMALY_COLUMNS
            ),
            AnomalyFilter::Kind(_) => format!(
                "SELECT {} FROM anomalies WHERE kind = $1 ORDER BY created_at DESC",
                ANOMALY_COLUMNS
            ),
        };

        let mut select = sqlx::query_as::<_, AnomalyRow>(&query);
        if let AnomalyFilter::Kind(tag) = filter {
            select = select.bind(*tag);
        }
        let rows = select.fetch_all(&self.pool).await.db()?;
        Ok(rows.into_iter().map(Anomaly::from).collect())
    }

    async fn review_anomaly(&self, id: Uuid, reviewer: Uuid, now: DateTime<Utc>) -> CoreResult<Anomaly> {
        let row: Option<AnomalyRow> = sqlx::query_as(&format!(
            "UPDATE anomalies SET reviewed = TRUE, reviewed_by = $2, reviewed_at = $3 WHERE id = $1 RETURNING {}",
            ANOMALY_COLUMNS
        ))
        .bind(id)
        .bind(reviewer)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .db()?;
        row.map(Anomaly::from).ok_or_else(|| CoreError::not_found("anomaly", id))
    }
}
