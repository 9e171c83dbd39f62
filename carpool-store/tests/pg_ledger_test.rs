//! Ledger properties against a live Postgres.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p carpool-store -- --ignored`.

use std::sync::Arc;

use carpool_core::lifecycle::Transition;
use carpool_core::models::{Actor, NewCar, ReservationStatus, Role, VoteKey};
use carpool_core::payment::{NewPayment, StaticPaymentVerifier, PaymentVerifier};
use carpool_core::{CoreError, Ledger};
use carpool_store::{DbClient, PgLedger};
use chrono::{Duration, NaiveDate, Utc};
use uuid::Uuid;

async fn ledger() -> Arc<PgLedger> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
    let db = DbClient::new(&url, 10).await.expect("connect");
    db.migrate().await.expect("migrate");
    Arc::new(PgLedger::new(db.pool, 2_000))
}

async fn car(ledger: &PgLedger, capacity: u32) -> Uuid {
    ledger
        .create_car(
            NewCar { title: format!("Test {}", Uuid::new_v4()), capacity, route: None, driver_id: None },
            Utc::now(),
        )
        .await
        .unwrap()
        .id
}

#[tokio::test]
#[ignore]
async fn pg_fills_car_in_order_then_rejects() {
    let ledger = ledger().await;
    let car_id = car(&ledger, 14).await;
    let now = Utc::now();

    for expected in 1..=14 {
        let seat = ledger.reserve_seat(car_id, Uuid::new_v4(), now, Duration::minutes(20)).await.unwrap();
        assert_eq!(seat.order_number, expected);
    }
    let err = ledger.reserve_seat(car_id, Uuid::new_v4(), now, Duration::minutes(20)).await.unwrap_err();
    assert_eq!(err, CoreError::CarFull(car_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn pg_race_for_last_seat() {
    let ledger = ledger().await;
    let car_id = car(&ledger, 1).await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger.reserve_seat(car_id, Uuid::new_v4(), Utc::now(), Duration::minutes(20)).await
            })
        })
        .collect();

    let mut winners = 0;
    let mut full = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(seat) => {
                winners += 1;
                assert_eq!(seat.order_number, 1);
            }
            Err(CoreError::CarFull(_)) => full += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((winners, full), (1, 1));
}

#[tokio::test]
#[ignore]
async fn pg_expiry_is_conditional() {
    let ledger = ledger().await;
    let car_id = car(&ledger, 2).await;
    let now = Utc::now();
    let passenger = Actor::new(Uuid::new_v4(), Role::Passenger);

    let held = ledger.reserve_seat(car_id, Uuid::new_v4(), now, Duration::minutes(20)).await.unwrap();
    let paid = ledger.reserve_seat(car_id, passenger.id, now, Duration::minutes(20)).await.unwrap();

    let verification = StaticPaymentVerifier::with_confidence(0.9).verify("r.jpg").await.unwrap();
    ledger
        .attach_payment(
            NewPayment { reservation_id: paid.reservation_id, image_ref: "r.jpg".to_string(), verification },
            passenger,
            false,
            now,
        )
        .await
        .unwrap();
    ledger
        .transition(paid.reservation_id, Transition::Confirm { admin_id: Uuid::new_v4() }, now)
        .await
        .unwrap();

    let later = now + Duration::minutes(21);
    assert!(ledger.expire_hold(held.reservation_id, later).await.unwrap());
    assert!(!ledger.expire_hold(held.reservation_id, later).await.unwrap());
    assert!(!ledger.expire_hold(paid.reservation_id, later).await.unwrap());

    let confirmed = ledger.get_reservation(paid.reservation_id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    assert_eq!(confirmed.expires_at, None);

    let payment = ledger.get_payment(paid.reservation_id).await.unwrap().unwrap();
    assert_eq!(payment.admin_confirmed, Some(true));
}

#[tokio::test]
#[ignore]
async fn pg_votes_are_unique_and_consumed_together() {
    let ledger = ledger().await;
    let key = VoteKey::new(format!("Route {}", Uuid::new_v4()), NaiveDate::from_ymd_opt(2030, 6, 1).unwrap());
    let voter = Uuid::new_v4();

    assert_eq!(ledger.cast_vote(&key, voter, Utc::now()).await.unwrap(), 1);
    assert!(matches!(
        ledger.cast_vote(&key, voter, Utc::now()).await,
        Err(CoreError::AlreadyVoted { .. })
    ));
    for _ in 0..13 {
        ledger.cast_vote(&key, Uuid::new_v4(), Utc::now()).await.unwrap();
    }

    let (car, extra) = ledger.accept_extra_car(&key, "Car X", 14, Utc::now()).await.unwrap();
    assert_eq!(car.capacity, 14);
    assert_eq!(extra.consumed_votes, 14);
    assert_eq!(ledger.unconsumed_votes(&key).await.unwrap(), 0);
    assert_eq!(ledger.cast_vote(&key, Uuid::new_v4(), Utc::now()).await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn pg_history_joins_car_and_lists_newest_first() {
    let ledger = ledger().await;
    let car_id = car(&ledger, 14).await;
    // Ahead of anything the other tests write, so these two rows lead the history.
    let later = Utc::now() + Duration::days(365);

    let first = ledger.reserve_seat(car_id, Uuid::new_v4(), later, Duration::minutes(20)).await.unwrap();
    let second = ledger
        .reserve_seat(car_id, Uuid::new_v4(), later + Duration::seconds(1), Duration::minutes(20))
        .await
        .unwrap();
    ledger
        .transition(first.reservation_id, Transition::Cancel { actor: Actor::new(Uuid::new_v4(), Role::Admin) }, later)
        .await
        .unwrap();

    let rows = ledger.list_reservations(2).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].reservation.id, second.reservation_id);
    assert_eq!(rows[1].reservation.id, first.reservation_id);
    assert_eq!(rows[1].reservation.status, ReservationStatus::Cancelled);
    assert!(rows[0].car_title.starts_with("Test "));
    assert_eq!(rows[0].passenger_name, None);
}
