pub mod app_config;
pub mod database;
pub mod error;
pub mod pg_ledger;
pub mod redis_repo;

pub use app_config::Config;
pub use database::DbClient;
pub use pg_ledger::PgLedger;
pub use redis_repo::RedisClient;
