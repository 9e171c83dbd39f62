use serde::Deserialize;
use std::env;

use carpool_core::anomaly::AnomalyRules;
use carpool_core::policy::{self, ReservationPolicy};
use carpool_core::retry::RetryConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub business_rules: BusinessRules,
    #[serde(default)]
    pub anomaly_rules: AnomalyRules,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BusinessRules {
    pub hold_minutes: i64,
    pub standard_capacity: u32,
    pub vote_threshold: u32,
    pub confidence_threshold: f64,
    pub sweep_interval_seconds: u64,
    pub reserve_max_retries: u32,
    pub reserve_retry_initial_ms: u64,
    pub lock_timeout_ms: u64,
    pub rate_limit_per_minute: i64,
    pub payment_rate_limit_per_minute: i64,
}

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            hold_minutes: policy::DEFAULT_HOLD_MINUTES,
            standard_capacity: policy::STANDARD_CAPACITY,
            vote_threshold: policy::VOTE_THRESHOLD,
            confidence_threshold: policy::CONFIDENCE_THRESHOLD,
            sweep_interval_seconds: 60,
            reserve_max_retries: 3,
            reserve_retry_initial_ms: 25,
            lock_timeout_ms: 2_000,
            rate_limit_per_minute: 100,
            payment_rate_limit_per_minute: 10,
        }
    }
}

impl BusinessRules {
    /// The slice of the rules the reservation engine consumes.
    pub fn to_policy(&self, anomaly_rules: AnomalyRules) -> ReservationPolicy {
        ReservationPolicy {
            hold_minutes: self.hold_minutes,
            standard_capacity: self.standard_capacity,
            vote_threshold: self.vote_threshold,
            confidence_threshold: self.confidence_threshold,
            reserve_retry: RetryConfig::default()
                .with_max_retries(self.reserve_max_retries)
                .with_initial_delay_ms(self.reserve_retry_initial_ms),
            anomaly_rules,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 10 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. CARPOOL__DATABASE__URL
            .add_source(config::Environment::with_prefix("CARPOOL").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_fill_in_defaults() {
        let source = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [server]
                port = 3000
                [database]
                url = "postgres://localhost/carpool"
                [auth]
                jwt_secret = "secret"
                [business_rules]
                hold_minutes = 30
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = source.try_deserialize().unwrap();

        assert!(config.redis.is_none());
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.business_rules.hold_minutes, 30);
        assert_eq!(config.business_rules.standard_capacity, 14);

        let policy = config.business_rules.to_policy(config.anomaly_rules);
        assert_eq!(policy.hold_duration(), chrono::Duration::minutes(30));
        assert_eq!(policy.reserve_retry.max_retries, 3);
        assert_eq!(policy.anomaly_rules.reservations_24h, 3);
    }
}
