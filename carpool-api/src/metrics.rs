//! Prometheus counters for the reservation engine and the `/metrics` endpoint.

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

use crate::state::AppState;

#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    reservations_total: IntCounterVec,
    holds_expired_total: IntCounter,
    votes_total: IntCounterVec,
    anomalies_detected_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reservations_total = IntCounterVec::new(
            Opts::new("carpool_reservations_total", "Seat reservation attempts partitioned by outcome."),
            &["outcome"],
        )?;
        let holds_expired_total =
            IntCounter::with_opts(Opts::new("carpool_holds_expired_total", "Temporary holds cancelled by the sweeper."))?;
        let votes_total = IntCounterVec::new(
            Opts::new("carpool_votes_total", "Extra-car votes partitioned by outcome."),
            &["outcome"],
        )?;
        let anomalies_detected_total =
            IntCounter::with_opts(Opts::new("carpool_anomalies_detected_total", "Anomalies recorded by detection runs."))?;

        registry.register(Box::new(reservations_total.clone()))?;
        registry.register(Box::new(holds_expired_total.clone()))?;
        registry.register(Box::new(votes_total.clone()))?;
        registry.register(Box::new(anomalies_detected_total.clone()))?;

        Ok(Self {
            registry,
            reservations_total,
            holds_expired_total,
            votes_total,
            anomalies_detected_total,
        })
    }

    /// `outcome` is `success` or a lower-cased error code.
    pub fn observe_reservation(&self, outcome: &str) {
        self.reservations_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_vote(&self, outcome: &str) {
        self.votes_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_expired(&self, count: usize) {
        self.holds_expired_total.inc_by(count as u64);
    }

    pub fn observe_anomalies(&self, count: usize) {
        self.anomalies_detected_total.inc_by(count as u64);
    }

    pub fn render(&self) -> Result<(String, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut encoded = Vec::new();
        encoder.encode(&self.registry.gather(), &mut encoded)?;
        Ok((encoder.format_type().to_string(), String::from_utf8_lossy(&encoded).into_owned()))
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok((content_type, body)) => ([(CONTENT_TYPE, content_type)], body).into_response(),
        Err(source) => {
            error!("failed to encode metrics response: {source}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_rendered() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_reservation("success");
        metrics.observe_reservation("car_full");
        metrics.observe_expired(3);

        let (content_type, body) = metrics.render().unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("carpool_reservations_total{outcome=\"car_full\"} 1"));
        assert!(body.contains("carpool_holds_expired_total 3"));
    }
}
