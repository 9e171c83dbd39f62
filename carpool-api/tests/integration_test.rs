use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use carpool_api::{
    app,
    metrics::Metrics,
    middleware::Claims,
    state::{AppState, AuthConfig, RateLimits},
};
use carpool_core::clock::ManualClock;
use carpool_core::payment::StaticPaymentVerifier;
use carpool_core::policy::ReservationPolicy;
use carpool_core::{InMemoryLedger, ReservationService};
use chrono::{Duration, NaiveDate};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "integration-secret";

struct TestApp {
    router: Router,
    clock: Arc<ManualClock>,
}

fn test_app() -> TestApp {
    let start = NaiveDate::from_ymd_opt(2024, 5, 20)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
        .and_utc();
    let clock = Arc::new(ManualClock::new(start));
    let service = Arc::new(ReservationService::new(
        Arc::new(InMemoryLedger::new()),
        clock.clone(),
        Arc::new(StaticPaymentVerifier::with_confidence(0.92)),
        ReservationPolicy::default(),
    ));

    let state = AppState {
        service,
        redis: None,
        metrics: Arc::new(Metrics::new().unwrap()),
        auth: AuthConfig { secret: SECRET.to_string() },
        rate_limits: RateLimits { per_minute: 100, payment_per_minute: 10 },
    };

    TestApp { router: app(state), clock }
}

fn token(id: Uuid, role: &str) -> String {
    let claims = Claims {
        sub: id.to_string(),
        role: role.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

struct User {
    id: Uuid,
    token: String,
}

fn user(role: &str) -> User {
    let id = Uuid::new_v4();
    User { id, token: token(id, role) }
}

impl TestApp {
    async fn send(&self, method: Method, uri: &str, user: Option<&User>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", user.token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    async fn create_car(&self, admin: &User, capacity: u32) -> Uuid {
        let (status, car) = self
            .send(Method::POST, "/v1/admin/cars", Some(admin), Some(json!({ "title": "Cairo-Alex", "capacity": capacity })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        car["id"].as_str().unwrap().parse().unwrap()
    }

    async fn reserve(&self, car_id: Uuid, passenger: &User) -> (StatusCode, Value) {
        self.send(Method::POST, &format!("/v1/cars/{}/reservations", car_id), Some(passenger), None)
            .await
    }
}

#[tokio::test]
async fn test_health_and_metrics_are_public() {
    let app = test_app();

    let (status, body) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = app.send(Method::GET, "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_v1_requires_valid_token() {
    let app = test_app();

    let (status, body) = app.send(Method::GET, "/v1/cars", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHENTICATED");

    let forged = User { id: Uuid::new_v4(), token: "not.a.jwt".to_string() };
    let (status, _) = app.send(Method::GET, "/v1/cars", Some(&forged), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.send(Method::GET, "/v1/cars", Some(&user("passenger")), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_role_gates() {
    let app = test_app();
    let passenger = user("passenger");
    let owner = user("owner");

    let (status, body) = app
        .send(Method::POST, "/v1/admin/cars", Some(&passenger), Some(json!({ "title": "X" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    let (status, _) = app.send(Method::GET, "/v1/owner/vote-groups", Some(&passenger), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.send(Method::GET, "/v1/owner/vote-groups", Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.send(Method::GET, "/v1/admin/payments/pending", Some(&owner), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_reserve_until_car_full() {
    let app = test_app();
    let admin = user("admin");
    let car_id = app.create_car(&admin, 2).await;

    let first = user("passenger");
    let (status, body) = app.reserve(car_id, &first).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["order_number"], 1);

    let (status, body) = app.reserve(car_id, &first).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "ALREADY_RESERVED");
    assert!(body["reservation_id"].is_null());

    let (status, body) = app.reserve(car_id, &user("passenger")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["order_number"], 2);

    let (status, body) = app.reserve(car_id, &user("passenger")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "CAR_FULL");

    let (status, body) = app.reserve(Uuid::new_v4(), &user("passenger")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (_, cars) = app.send(Method::GET, "/v1/cars", Some(&first), None).await;
    assert_eq!(cars[0]["available_seats"], 0);

    let (_, metrics) = app.send(Method::GET, "/metrics", None, None).await;
    let text = metrics.as_str().unwrap();
    assert!(text.contains(r#"carpool_reservations_total{outcome="success"} 2"#));
    assert!(text.contains(r#"carpool_reservations_total{outcome="car_full"} 1"#));
}

#[tokio::test]
async fn test_payment_review_queue_and_arrival() {
    let app = test_app();
    let admin = user("admin");
    let driver = user("driver");
    let passenger = user("passenger");
    let car_id = app.create_car(&admin, 14).await;

    let (status, _) = app
        .send(Method::PUT, "/v1/profile", Some(&passenger), Some(json!({ "name": "Mona", "phone": "01012345678" })))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, seat) = app.reserve(car_id, &passenger).await;
    let reservation_id = seat["reservation_id"].as_str().unwrap().to_string();

    // Confirmation needs a receipt first.
    let confirm_uri = format!("/v1/admin/reservations/{}/confirm", reservation_id);
    let (status, body) = app.send(Method::POST, &confirm_uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "PAYMENT_MISSING");

    let payment_uri = format!("/v1/reservations/{}/payment", reservation_id);
    let (status, _) = app
        .send(Method::POST, &payment_uri, Some(&user("passenger")), Some(json!({ "image_ref": "receipts/a.jpg" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, payment) = app
        .send(Method::POST, &payment_uri, Some(&passenger), Some(json!({ "image_ref": "receipts/a.jpg" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(payment["reservation_id"], reservation_id.as_str());

    let (_, pending) = app.send(Method::GET, "/v1/admin/payments/pending", Some(&admin), None).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let (status, confirmed) = app.send(Method::POST, &confirm_uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "confirmed");

    let queue_uri = format!("/v1/cars/{}/queue", car_id);
    let (_, view) = app.send(Method::GET, &queue_uri, Some(&passenger), None).await;
    assert_eq!(view["view"], "passenger");
    assert_eq!(view["entries"][0]["passenger_name"], "Mona");
    assert!(view["entries"][0].get("passenger_phone").is_none());

    let arrival_uri = format!("/v1/reservations/{}/arrival", reservation_id);
    let (status, _) = app
        .send(Method::POST, &arrival_uri, Some(&passenger), Some(json!({ "arrived": true })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, arrival) = app
        .send(Method::POST, &arrival_uri, Some(&driver), Some(json!({ "arrived": true })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(arrival["arrived"], true);

    let (_, view) = app.send(Method::GET, &queue_uri, Some(&driver), None).await;
    assert_eq!(view["view"], "driver");
    assert_eq!(view["entries"][0]["passenger_phone"], "01012345678");
    assert_eq!(view["entries"][0]["arrived"], true);

    let (_, mine) = app.send(Method::GET, "/v1/reservations/me", Some(&passenger), None).await;
    assert_eq!(mine["status"], "confirmed");
}

#[tokio::test]
async fn test_sweep_releases_lapsed_hold() {
    let app = test_app();
    let admin = user("admin");
    let passenger = user("passenger");
    let car_id = app.create_car(&admin, 1).await;

    let (status, _) = app.reserve(car_id, &passenger).await;
    assert_eq!(status, StatusCode::CREATED);

    app.clock.advance(Duration::minutes(21));
    let (status, report) = app.send(Method::POST, "/v1/admin/maintenance/sweep", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["expired"], 1);

    let (_, mine) = app.send(Method::GET, "/v1/reservations/me", Some(&passenger), None).await;
    assert!(mine.is_null());

    let (status, body) = app.reserve(car_id, &user("passenger")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["order_number"], 2);
}

#[tokio::test]
async fn test_cancel_by_owner_of_reservation() {
    let app = test_app();
    let admin = user("admin");
    let passenger = user("passenger");
    let car_id = app.create_car(&admin, 14).await;

    let (_, seat) = app.reserve(car_id, &passenger).await;
    let cancel_uri = format!("/v1/reservations/{}/cancel", seat["reservation_id"].as_str().unwrap());

    let (status, _) = app.send(Method::POST, &cancel_uri, Some(&user("passenger")), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, cancelled) = app.send(Method::POST, &cancel_uri, Some(&passenger), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    let (status, body) = app.send(Method::POST, &cancel_uri, Some(&passenger), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "NOT_CANCELLABLE");
}

#[tokio::test]
async fn test_votes_and_extra_car() {
    let app = test_app();
    let owner = user("owner");
    let voters: Vec<User> = (0..3).map(|_| user("passenger")).collect();
    let ballot = json!({ "route": "Cairo-Alex", "travel_date": "2024-06-01" });

    for (i, voter) in voters.iter().enumerate() {
        let (status, summary) = app.send(Method::POST, "/v1/votes", Some(voter), Some(ballot.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["votes_count"], i as u64 + 1);
    }

    let (status, body) = app.send(Method::POST, "/v1/votes", Some(&voters[0]), Some(ballot.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_VOTED");

    let (_, summary) = app
        .send(Method::GET, "/v1/votes/summary?route=Cairo-Alex&travel_date=2024-06-01", Some(&voters[0]), None)
        .await;
    assert_eq!(summary["votes_count"], 3);
    assert_eq!(summary["remaining_to_trigger"], 11);

    let (_, groups) = app.send(Method::GET, "/v1/owner/vote-groups", Some(&owner), None).await;
    assert_eq!(groups[0]["route"], "Cairo-Alex");
    assert_eq!(groups[0]["votes_count"], 3);

    let (status, extra) = app
        .send(
            Method::POST,
            "/v1/owner/extra-cars",
            Some(&owner),
            Some(json!({ "route": "Cairo-Alex", "travel_date": "2024-06-01", "title": "Extra 1" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(extra["consumed_votes"], 3);

    let (status, body) = app
        .send(
            Method::POST,
            "/v1/owner/extra-cars",
            Some(&owner),
            Some(json!({ "route": "Cairo-Alex", "travel_date": "2024-06-01", "title": "Extra 2" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "NO_PENDING_VOTES");
}

#[tokio::test]
async fn test_anomaly_filter_validation() {
    let app = test_app();
    let admin = user("admin");

    let (status, body) = app.send(Method::GET, "/v1/admin/anomalies?filter=bogus", Some(&admin), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");

    let (status, body) = app.send(Method::POST, "/v1/admin/anomalies/detect", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recorded"], 0);

    let (status, list) = app.send(Method::GET, "/v1/admin/anomalies?filter=unreviewed", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_stream_is_event_stream() {
    let app = test_app();
    let passenger = user("passenger");

    let request = Request::builder()
        .uri(format!("/v1/cars/{}/queue/stream", Uuid::new_v4()))
        .header(header::AUTHORIZATION, format!("Bearer {}", passenger.token))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
}

#[tokio::test]
async fn test_owner_sees_driver_queue_view() {
    let app = test_app();
    let admin = user("admin");
    let owner = user("owner");
    let passenger = user("passenger");
    let car_id = app.create_car(&admin, 14).await;

    app.send(Method::PUT, "/v1/profile", Some(&passenger), Some(json!({ "name": "Mona", "phone": "01012345678" })))
        .await;
    app.reserve(car_id, &passenger).await;

    let (status, view) = app.send(Method::GET, &format!("/v1/cars/{}/queue", car_id), Some(&owner), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["view"], "driver");
    assert_eq!(view["entries"][0]["passenger_phone"], "01012345678");
}

#[tokio::test]
async fn test_admin_reservation_history() {
    let app = test_app();
    let admin = user("admin");
    let car_id = app.create_car(&admin, 14).await;

    let passenger = user("passenger");
    app.send(Method::PUT, "/v1/profile", Some(&passenger), Some(json!({ "name": "Mona", "phone": "01012345678" })))
        .await;
    let (_, seat) = app.reserve(car_id, &passenger).await;
    let reservation_id = seat["reservation_id"].as_str().unwrap().to_string();
    let cancel_uri = format!("/v1/reservations/{}/cancel", reservation_id);
    app.send(Method::POST, &cancel_uri, Some(&passenger), None).await;

    app.clock.advance(Duration::minutes(1));
    app.reserve(car_id, &user("passenger")).await;

    let (status, _) = app.send(Method::GET, "/v1/admin/reservations", Some(&passenger), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, history) = app.send(Method::GET, "/v1/admin/reservations", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    let rows = history.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["order_number"], 2);
    assert_eq!(rows[0]["status"], "temporary");
    assert_eq!(rows[1]["id"], reservation_id.as_str());
    assert_eq!(rows[1]["status"], "cancelled");
    assert_eq!(rows[1]["passenger_name"], "Mona");
    assert_eq!(rows[1]["passenger_phone"], "01012345678");
    assert_eq!(rows[1]["car_title"], "Cairo-Alex");
    assert_eq!(rows[1]["low_confidence"], false);

    let (_, newest) = app.send(Method::GET, "/v1/admin/reservations?limit=1", Some(&admin), None).await;
    assert_eq!(newest.as_array().unwrap().len(), 1);
}
