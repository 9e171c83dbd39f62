use std::sync::Arc;

use carpool_core::ReservationService;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::metrics::Metrics;

/// One maintenance pass: expire lapsed holds, drop votes for past dates, run anomaly detection.
///
/// Each step is independent; a failure is logged and the next step still runs.
pub async fn run_maintenance(service: &ReservationService, metrics: &Metrics) {
    match service.sweep().await {
        Ok(report) => metrics.observe_expired(report.expired),
        Err(e) => error!(code = e.code(), "Expiry sweep failed: {}", e),
    }

    if let Err(e) = service.purge_stale_votes().await {
        error!(code = e.code(), "Vote purge failed: {}", e);
    }

    match service.detect_anomalies().await {
        Ok(recorded) => metrics.observe_anomalies(recorded),
        Err(e) => error!(code = e.code(), "Anomaly detection failed: {}", e),
    }
}

pub async fn start_maintenance_worker(service: Arc<ReservationService>, metrics: Arc<Metrics>, every: Duration) {
    info!("Maintenance worker started, running every {:?}", every);

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        run_maintenance(&service, &metrics).await;
    }
}
