use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::anomaly::AnomalyRules;
use crate::retry::RetryConfig;

pub const DEFAULT_HOLD_MINUTES: i64 = 20;
pub const STANDARD_CAPACITY: u32 = 14;
pub const VOTE_THRESHOLD: u32 = 14;
pub const CONFIDENCE_THRESHOLD: f64 = 0.75;
pub const MAX_CAR_CAPACITY: u32 = 64;
pub const RESERVATION_HISTORY_LIMIT: u32 = 100;

/// Tunables consumed by the reservation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationPolicy {
    pub hold_minutes: i64,
    pub standard_capacity: u32,
    pub vote_threshold: u32,
    pub confidence_threshold: f64,
    pub reserve_retry: RetryConfig,
    pub anomaly_rules: AnomalyRules,
}

impl ReservationPolicy {
    pub fn hold_duration(&self) -> Duration {
        Duration::minutes(self.hold_minutes)
    }

    /// Below the threshold the screenshot needs manual review.
    pub fn is_low_confidence(&self, confidence: f64) -> bool {
        confidence < self.confidence_threshold
    }
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            hold_minutes: DEFAULT_HOLD_MINUTES,
            standard_capacity: STANDARD_CAPACITY,
            vote_threshold: VOTE_THRESHOLD,
            confidence_threshold: CONFIDENCE_THRESHOLD,
            reserve_retry: RetryConfig::default(),
            anomaly_rules: AnomalyRules::default(),
        }
    }
}
