use redis::RedisResult;

// INCR, then start the window only on the first hit. A key left without a TTL
// (e.g. by an older client) gets one too.
const RATE_LIMIT_SCRIPT: &str = r#"
    local count = redis.call("INCR", KEYS[1])
    if count == 1 or redis.call("TTL", KEYS[1]) == -1 then
        redis.call("EXPIRE", KEYS[1], ARGV[1])
    end
    return count
"#;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Fixed-window counter. Returns whether this hit is within `limit`.
    ///
    /// The TTL is set by the hit that opens the window and never refreshed, so the
    /// count resets `window_seconds` after the first hit however busy the caller is.
    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let count: i64 = redis::Script::new(RATE_LIMIT_SCRIPT)
            .key(key)
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }
}

pub fn ip_rate_key(ip: &str) -> String {
    format!("rate_limit:ip:{}", ip)
}

pub fn payment_rate_key(user_id: &uuid::Uuid) -> String {
    format!("rate_limit:payment:{}", user_id)
}
