use super::types::{RateLimitAlgorithm, RateLimitPolicy, StoreOutcome};
use super::{fixed_window_start, RateLimitStore};
use crate::error::Result;
use async_trait::async_trait;
use moka::sync::Cache;
use moka::Expiry;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

/// Per-key algorithm state
#[derive(Debug, Clone, PartialEq)]
enum BucketState {
    Tokens { tokens: f64, last_refill_ms: u64 },
    Log(VecDeque<u64>),
    Window { start_ms: u64, count: u64 },
    Leaky { count: f64, last_leak_ms: u64 },
}

impl BucketState {
    fn fresh(policy: &RateLimitPolicy, now_ms: u64) -> Self {
        match policy.algorithm {
            RateLimitAlgorithm::TokenBucket => BucketState::Tokens {
                tokens: policy.capacity() as f64,
                last_refill_ms: now_ms,
            },
            RateLimitAlgorithm::SlidingWindow => BucketState::Log(VecDeque::new()),
            RateLimitAlgorithm::FixedWindow => BucketState::Window {
                start_ms: fixed_window_start(now_ms, policy.window_ms()),
                count: 0,
            },
            RateLimitAlgorithm::LeakyBucket => BucketState::Leaky {
                count: 0.0,
                last_leak_ms: now_ms,
            },
        }
    }

    fn algorithm(&self) -> RateLimitAlgorithm {
        match self {
            BucketState::Tokens { .. } => RateLimitAlgorithm::TokenBucket,
            BucketState::Log(_) => RateLimitAlgorithm::SlidingWindow,
            BucketState::Window { .. } => RateLimitAlgorithm::FixedWindow,
            BucketState::Leaky { .. } => RateLimitAlgorithm::LeakyBucket,
        }
    }
}

/// Keys with no traffic are dropped after this many windows
const IDLE_WINDOWS: u32 = 2;

/// Default bound on tracked keys
const DEFAULT_MAX_KEYS: u64 = 1_000_000;

#[derive(Debug)]
struct Bucket {
    state: Mutex<BucketState>,
    idle: Duration,
}

impl Bucket {
    fn new(policy: &RateLimitPolicy, now_ms: u64) -> Self {
        Self {
            state: Mutex::new(BucketState::fresh(policy, now_ms)),
            idle: idle_time(policy),
        }
    }
}

/// Time after which an untouched key carries no information
fn idle_time(policy: &RateLimitPolicy) -> Duration {
    let window = Duration::from_millis(policy.window_ms());
    let span = match policy.algorithm {
        RateLimitAlgorithm::TokenBucket => {
            Duration::try_from_secs_f64(policy.capacity() as f64 / policy.refill_rate())
                .unwrap_or(window)
                .max(window)
        }
        _ => window,
    };
    span.saturating_mul(IDLE_WINDOWS).max(Duration::from_secs(1))
}

struct BucketExpiry;

impl Expiry<String, Arc<Bucket>> for BucketExpiry {
    fn expire_after_create(&self, _: &String, bucket: &Arc<Bucket>, _: Instant) -> Option<Duration> {
        Some(bucket.idle)
    }

    fn expire_after_read(
        &self,
        _: &String,
        bucket: &Arc<Bucket>,
        _: Instant,
        _: Option<Duration>,
        _: Instant,
    ) -> Option<Duration> {
        Some(bucket.idle)
    }

    fn expire_after_update(
        &self,
        _: &String,
        bucket: &Arc<Bucket>,
        _: Instant,
        _: Option<Duration>,
    ) -> Option<Duration> {
        Some(bucket.idle)
    }
}

/// In-process store.
///
/// Each key's state is updated under its own lock, so checks are atomic
/// within this process. Idle keys expire after [`IDLE_WINDOWS`] windows.
/// Quota is not shared between gateway instances; use
/// [`RedisStore`](super::RedisStore) for that.
pub struct MemoryStore {
    buckets: Cache<String, Arc<Bucket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_keys(DEFAULT_MAX_KEYS)
    }

    pub fn with_max_keys(max_keys: u64) -> Self {
        Self {
            buckets: Cache::builder()
                .max_capacity(max_keys)
                .expire_after(BucketExpiry)
                .build(),
        }
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.buckets.run_pending_tasks();
        self.buckets.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply(&self, key: &str, policy: &RateLimitPolicy, weight: u64, now_ms: u64) -> StoreOutcome {
        if weight > policy.max_weight() {
            return StoreOutcome::oversized(policy);
        }

        let bucket = self
            .buckets
            .get_with_by_ref(key, || Arc::new(Bucket::new(policy, now_ms)));
        let mut state = bucket.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.algorithm() != policy.algorithm {
            *state = BucketState::fresh(policy, now_ms);
        }

        match &mut *state {
            BucketState::Tokens {
                tokens,
                last_refill_ms,
            } => token_bucket(tokens, last_refill_ms, policy, weight, now_ms),
            BucketState::Log(log) => sliding_window(log, policy, weight, now_ms),
            BucketState::Window { start_ms, count } => {
                fixed_window(start_ms, count, policy, weight, now_ms)
            }
            BucketState::Leaky {
                count,
                last_leak_ms,
            } => leaky_bucket(count, last_leak_ms, policy, weight, now_ms),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.buckets.entry_count())
            .finish()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn evaluate(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        weight: u64,
        now_ms: u64,
    ) -> Result<StoreOutcome> {
        let outcome = self.apply(key, policy, weight, now_ms);
        trace!(key, ?outcome, "Memory store evaluation");
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

fn ceil_secs(ms: f64) -> u64 {
    (ms / 1000.0).ceil().max(0.0) as u64
}

fn token_bucket(
    tokens: &mut f64,
    last_refill_ms: &mut u64,
    policy: &RateLimitPolicy,
    weight: u64,
    now_ms: u64,
) -> StoreOutcome {
    let capacity = policy.capacity() as f64;
    let rate = policy.refill_rate();
    let weight = weight as f64;

    let elapsed = now_ms.saturating_sub(*last_refill_ms) as f64;
    *tokens = capacity.min(*tokens + elapsed * rate / 1000.0);
    *last_refill_ms = (*last_refill_ms).max(now_ms);

    if *tokens >= weight {
        *tokens -= weight;
        StoreOutcome {
            allowed: true,
            remaining: tokens.floor() as u64,
            reset_after_secs: ((capacity - *tokens) / rate).ceil() as u64,
        }
    } else {
        StoreOutcome {
            allowed: false,
            remaining: tokens.floor() as u64,
            reset_after_secs: ((weight - *tokens) / rate).ceil() as u64,
        }
    }
}

fn sliding_window(
    log: &mut VecDeque<u64>,
    policy: &RateLimitPolicy,
    weight: u64,
    now_ms: u64,
) -> StoreOutcome {
    let window_ms = policy.window_ms();
    let limit = policy.max_requests;

    // Entries at or before `now - window` have left the window
    let cutoff = now_ms.saturating_sub(window_ms);
    while log.front().is_some_and(|&ts| ts <= cutoff && now_ms >= window_ms) {
        log.pop_front();
    }

    let current = log.len() as u64;
    let remaining = limit.saturating_sub(current);

    let allowed = current.saturating_add(weight) <= limit;
    if allowed {
        log.extend(std::iter::repeat(now_ms).take(weight as usize));
    }

    let reset_after_secs = match log.front() {
        Some(&oldest) => ceil_secs((oldest + window_ms) as f64 - now_ms as f64),
        None => ceil_secs(window_ms as f64),
    };

    StoreOutcome {
        allowed,
        remaining,
        reset_after_secs: reset_after_secs.max(1),
    }
}

fn fixed_window(
    start_ms: &mut u64,
    count: &mut u64,
    policy: &RateLimitPolicy,
    weight: u64,
    now_ms: u64,
) -> StoreOutcome {
    let window_ms = policy.window_ms();
    let window_start = fixed_window_start(now_ms, window_ms);
    if window_start != *start_ms {
        *start_ms = window_start;
        *count = 0;
    }

    *count = count.saturating_add(weight);
    let until_next = window_start + window_ms - now_ms;

    StoreOutcome {
        allowed: *count <= policy.max_requests,
        remaining: policy.max_requests.saturating_sub(*count),
        reset_after_secs: ceil_secs(until_next as f64).max(1),
    }
}

fn leaky_bucket(
    count: &mut f64,
    last_leak_ms: &mut u64,
    policy: &RateLimitPolicy,
    weight: u64,
    now_ms: u64,
) -> StoreOutcome {
    let rate = policy.max_requests as f64;
    let window_ms = policy.window_ms() as f64;

    let elapsed = now_ms.saturating_sub(*last_leak_ms) as f64;
    *count = (*count - elapsed * rate / window_ms).max(0.0);
    *last_leak_ms = (*last_leak_ms).max(now_ms);

    let (allowed, reset_ms) = if *count >= rate {
        (false, (*count - rate) * window_ms / rate)
    } else {
        *count += weight as f64;
        (true, *count * window_ms / rate)
    };

    StoreOutcome {
        allowed,
        remaining: (rate - *count).floor().max(0.0) as u64,
        reset_after_secs: ceil_secs(reset_ms).max(1),
    }
}
