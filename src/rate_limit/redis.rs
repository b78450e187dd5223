use super::lua_scripts::{
    FIXED_WINDOW_SCRIPT, LEAKY_BUCKET_SCRIPT, SLIDING_WINDOW_SCRIPT, TOKEN_BUCKET_SCRIPT,
};
use super::types::{RateLimitAlgorithm, RateLimitPolicy, StoreOutcome};
use super::{fixed_window_start, RateLimitStore};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use tracing::{debug, info};

/// Redis-backed store shared by every gateway instance
#[derive(Clone)]
pub struct RedisStore {
    /// Multiplexed connection, cheap to clone per call
    connection: ConnectionManager,
    token_bucket: Script,
    sliding_window: Script,
    fixed_window: Script,
    leaky_bucket: Script,
}

impl RedisStore {
    /// Connect to Redis at `redis_url`
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(store_error)?;
        let connection = ConnectionManager::new(client).await.map_err(store_error)?;

        info!(redis_url, "Connected rate limit store");

        Ok(Self {
            connection,
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            leaky_bucket: Script::new(LEAKY_BUCKET_SCRIPT),
        })
    }

    /// Test Redis connection
    pub async fn ping(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn evaluate(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        weight: u64,
        now_ms: u64,
    ) -> Result<StoreOutcome> {
        let mut connection = self.connection.clone();
        let window_ms = policy.window_ms();

        let reply = match policy.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                self.token_bucket
                    .key(key)
                    .arg(policy.capacity())
                    .arg(policy.refill_rate())
                    .arg(weight)
                    .arg(now_ms)
                    .invoke_async::<_, Vec<i64>>(&mut connection)
                    .await
            }
            RateLimitAlgorithm::SlidingWindow => {
                self.sliding_window
                    .key(key)
                    .arg(policy.max_requests)
                    .arg(window_ms)
                    .arg(weight)
                    .arg(now_ms)
                    .invoke_async::<_, Vec<i64>>(&mut connection)
                    .await
            }
            RateLimitAlgorithm::FixedWindow => {
                let window_start = fixed_window_start(now_ms, window_ms);
                self.fixed_window
                    .key(format!("{}:{}", key, window_start))
                    .arg(policy.max_requests)
                    .arg(window_ms)
                    .arg(weight)
                    .arg(now_ms)
                    .arg(window_start)
                    .invoke_async::<_, Vec<i64>>(&mut connection)
                    .await
            }
            RateLimitAlgorithm::LeakyBucket => {
                self.leaky_bucket
                    .key(key)
                    .arg(policy.max_requests)
                    .arg(window_ms)
                    .arg(weight)
                    .arg(now_ms)
                    .invoke_async::<_, Vec<i64>>(&mut connection)
                    .await
            }
        }
        .map_err(store_error)?;

        let outcome = StoreOutcome::from_script_reply(&reply)?;
        debug!(
            key,
            algorithm = %policy.algorithm,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            reset_after = outcome.reset_after_secs,
            "Redis rate limit evaluation"
        );
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn store_error(e: redis::RedisError) -> GatewayError {
    GatewayError::RateLimitStoreUnavailable(e.to_string())
}
