use std::sync::Arc;
use carpool_core::ReservationService;
use carpool_store::RedisClient;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone, Copy)]
pub struct RateLimits {
    pub per_minute: i64,
    pub payment_per_minute: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ReservationService>,
    /// Absent Redis disables rate limiting.
    pub redis: Option<Arc<RedisClient>>,
    pub metrics: Arc<Metrics>,
    pub auth: AuthConfig,
    pub rate_limits: RateLimits,
}
