use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::{info, warn};
use serde_json::Value;

use crate::app_config::BusinessRules;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    rule_key: String,
    rule_value: Value,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Overlay rules stored in the `business_rules` table on top of the file/env config.
    pub async fn fetch_business_rules(&self, defaults: BusinessRules) -> Result<BusinessRules, sqlx::Error> {
        let rows: Vec<RuleRow> = sqlx::query_as("SELECT rule_key, rule_value FROM business_rules")
            .fetch_all(&self.pool)
            .await?;

        let mut rules = defaults;
        for row in rows {
            apply_rule(&mut rules, &row.rule_key, &row.rule_value);
        }
        Ok(rules)
    }
}

/// Expected shape: `{"value": <number>}`. Unknown keys and mistyped values are ignored.
fn apply_rule(rules: &mut BusinessRules, key: &str, raw: &Value) {
    let Some(v) = raw.get("value") else {
        warn!(rule_key = key, "Business rule without a value field, ignored");
        return;
    };

    let as_u32 = |v: &Value| v.as_u64().and_then(|u| u32::try_from(u).ok());
    match key {
        "hold_minutes" => {
            if let Some(i) = v.as_i64().filter(|i| *i > 0) {
                rules.hold_minutes = i;
            }
        }
        "standard_capacity" => {
            if let Some(u) = as_u32(v).filter(|u| *u > 0) {
                rules.standard_capacity = u;
            }
        }
        "vote_threshold" => {
            if let Some(u) = as_u32(v).filter(|u| *u > 0) {
                rules.vote_threshold = u;
            }
        }
        "confidence_threshold" => {
            if let Some(f) = v.as_f64().filter(|f| (0.0..=1.0).contains(f)) {
                rules.confidence_threshold = f;
            }
        }
        "sweep_interval_seconds" => {
            if let Some(u) = v.as_u64().filter(|u| *u > 0) {
                rules.sweep_interval_seconds = u;
            }
        }
        "reserve_max_retries" => {
            if let Some(u) = as_u32(v) {
                rules.reserve_max_retries = u;
            }
        }
        "reserve_retry_initial_ms" => {
            if let Some(u) = v.as_u64() {
                rules.reserve_retry_initial_ms = u;
            }
        }
        "lock_timeout_ms" => {
            if let Some(u) = v.as_u64() {
                rules.lock_timeout_ms = u;
            }
        }
        "rate_limit_per_minute" => {
            if let Some(i) = v.as_i64() {
                rules.rate_limit_per_minute = i;
            }
        }
        "payment_rate_limit_per_minute" => {
            if let Some(i) = v.as_i64() {
                rules.payment_rate_limit_per_minute = i;
            }
        }
        _ => {}
    }
}
