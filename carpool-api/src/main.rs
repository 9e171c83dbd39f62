use std::net::SocketAddr;
use std::sync::Arc;

use carpool_api::{
    app,
    metrics::Metrics,
    state::{AppState, AuthConfig, RateLimits},
    worker,
};
use carpool_core::clock::SystemClock;
use carpool_core::payment::MockPaymentVerifier;
use carpool_core::ReservationService;
use carpool_store::{Config, DbClient, PgLedger, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "carpool_api=debug,carpool_core=info,carpool_store=info,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().expect("Failed to load config");
    tracing::info!("Starting carpool API on port {}", config.server.port);

    // Database Connection
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .expect("Failed to connect to Postgres");
    db.migrate().await.expect("Failed to run migrations");

    let rules = match db.fetch_business_rules(config.business_rules.clone()).await {
        Ok(rules) => rules,
        Err(e) => {
            tracing::warn!("Could not load stored business rules, using config values: {}", e);
            config.business_rules.clone()
        }
    };

    // Redis is optional; without it rate limiting is off.
    let redis = match &config.redis {
        Some(redis_config) => match RedisClient::new(&redis_config.url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!("Redis unavailable, rate limiting disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let ledger = Arc::new(PgLedger::new(db.pool.clone(), rules.lock_timeout_ms));
    let service = Arc::new(ReservationService::new(
        ledger,
        Arc::new(SystemClock),
        Arc::new(MockPaymentVerifier),
        rules.to_policy(config.anomaly_rules.clone()),
    ));
    let metrics = Arc::new(Metrics::new().expect("Failed to register metrics"));

    // Maintenance Worker
    tokio::spawn(worker::start_maintenance_worker(
        service.clone(),
        metrics.clone(),
        tokio::time::Duration::from_secs(rules.sweep_interval_seconds.max(1)),
    ));

    let app_state = AppState {
        service,
        redis,
        metrics,
        auth: AuthConfig { secret: config.auth.jwt_secret.clone() },
        rate_limits: RateLimits {
            per_minute: rules.rate_limit_per_minute,
            payment_per_minute: rules.payment_rate_limit_per_minute,
        },
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind listener");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("Server error");
}
