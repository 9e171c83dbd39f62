//! Rate-limit window against a live Redis.
//!
//! Run with `REDIS_URL=redis://... cargo test -p carpool-store -- --ignored`.

use std::time::Duration;

use carpool_store::redis_repo::payment_rate_key;
use carpool_store::RedisClient;
use redis::AsyncCommands;
use uuid::Uuid;

fn redis_url() -> String {
    std::env::var("REDIS_URL").expect("REDIS_URL must be set for ignored tests")
}

async fn ttl(key: &str) -> i64 {
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    conn.ttl(key).await.unwrap()
}

#[tokio::test]
#[ignore]
async fn redis_counts_hits_against_the_limit() {
    let limiter = RedisClient::new(&redis_url()).await.unwrap();
    let key = payment_rate_key(&Uuid::new_v4());

    assert!(limiter.check_rate_limit(&key, 2, 60).await.unwrap());
    assert!(limiter.check_rate_limit(&key, 2, 60).await.unwrap());
    assert!(!limiter.check_rate_limit(&key, 2, 60).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn redis_later_hits_do_not_extend_the_window() {
    let limiter = RedisClient::new(&redis_url()).await.unwrap();
    let key = payment_rate_key(&Uuid::new_v4());

    assert!(limiter.check_rate_limit(&key, 1, 3).await.unwrap());
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(!limiter.check_rate_limit(&key, 1, 3).await.unwrap());
    assert!(ttl(&key).await <= 2);

    // The window opened by the first hit has closed; the caller is admitted again.
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(limiter.check_rate_limit(&key, 1, 3).await.unwrap());
}
