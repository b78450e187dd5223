//! Distributed rate limiting
//!
//! Quota state lives in a shared store that evaluates every check-and-update
//! atomically, so any number of gateway instances enforce one quota:
//!
//! - **Token Bucket**: refill up to a burst capacity, deduct the request weight
//! - **Sliding Window**: timestamp log over a trailing window
//! - **Fixed Window**: counter per `floor(now / window)` boundary
//! - **Leaky Bucket**: counter draining at `max_requests` per window
//!
//! [`RedisStore`] runs each algorithm as one Lua script. [`MemoryStore`]
//! applies the same arithmetic under a per-key lock for single-instance use
//! and tests. Policies come from a [`PolicySource`]; when the store cannot be
//! reached within its timeout the request is allowed (fail open).
//!
//! # Example
//!
//! ```rust,no_run
//! use routing_gateway::rate_limit::{
//!     InMemoryPolicyStore, MemoryStore, RateLimitAlgorithm, RateLimitPolicy, RateLimiterService,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policies = InMemoryPolicyStore::new();
//!     policies
//!         .create(RateLimitPolicy::new(
//!             "orders-default",
//!             "*",
//!             "/api/orders/**",
//!             RateLimitAlgorithm::TokenBucket,
//!             100,
//!             60,
//!         ))
//!         .unwrap();
//!
//!     let service = RateLimiterService::new(Arc::new(policies), Arc::new(MemoryStore::new()));
//!     let decision = service.check("client-a", "/api/orders/**", 1).await;
//!     assert!(decision.allowed);
//! }
//! ```

pub mod clock;
pub mod local;
pub mod lua_scripts;
pub mod policy;
pub mod redis;
pub mod response;
pub mod service;
pub mod types;

use crate::error::Result;
use async_trait::async_trait;

pub use clock::{Clock, ManualClock, SystemClock};
pub use local::MemoryStore;
pub use policy::{InMemoryPolicyStore, PolicySource};
pub use redis::RedisStore;
pub use response::{apply_rate_limit_headers, rate_limited_response};
pub use service::{RateLimitSettings, RateLimiterService};
pub use types::{
    RateLimitAlgorithm, RateLimitDecision, RateLimitPolicy, RateLimitSubject, StoreOutcome,
};

/// Shared quota store with atomic check-and-update per key
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Evaluate `policy` for `key`, consuming `weight` units if allowed
    async fn evaluate(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        weight: u64,
        now_ms: u64,
    ) -> Result<StoreOutcome>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Window start for a fixed window containing `now_ms`
pub fn fixed_window_start(now_ms: u64, window_ms: u64) -> u64 {
    (now_ms / window_ms) * window_ms
}
