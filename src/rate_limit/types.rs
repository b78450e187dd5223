use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wildcard accepted for a policy's `client_id` or `endpoint`
pub const ANY: &str = "*";

/// Rate limiting algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitAlgorithm {
    /// Refilling bucket with burst capacity
    TokenBucket,
    /// Log of request timestamps over a trailing window
    SlidingWindow,
    /// Counter per aligned window
    FixedWindow,
    /// Counter draining at a constant rate
    LeakyBucket,
}

impl RateLimitAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::TokenBucket => "token_bucket",
            RateLimitAlgorithm::SlidingWindow => "sliding_window",
            RateLimitAlgorithm::FixedWindow => "fixed_window",
            RateLimitAlgorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota configuration bound to a client/endpoint scope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitPolicy {
    pub policy_id: String,
    /// Client identity this policy applies to, or `*`
    pub client_id: String,
    /// Only applies when the request carries this API key
    #[serde(default)]
    pub api_key: Option<String>,
    /// Only applies when the request belongs to this tenant
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Route endpoint this policy applies to, or `*`
    pub endpoint: String,
    pub algorithm: RateLimitAlgorithm,
    pub max_requests: u64,
    pub time_window_seconds: u64,
    /// Token bucket capacity (defaults to `max_requests`)
    #[serde(default)]
    pub burst_capacity: Option<u64>,
    /// Token bucket refill rate (defaults to `max_requests / time_window_seconds`)
    #[serde(default)]
    pub refill_rate_per_second: Option<f64>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl RateLimitPolicy {
    pub fn new(
        policy_id: &str,
        client_id: &str,
        endpoint: &str,
        algorithm: RateLimitAlgorithm,
        max_requests: u64,
        time_window_seconds: u64,
    ) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            client_id: client_id.to_string(),
            api_key: None,
            tenant_id: None,
            endpoint: endpoint.to_string(),
            algorithm,
            max_requests,
            time_window_seconds,
            burst_capacity: None,
            refill_rate_per_second: None,
            priority: 0,
            is_active: true,
        }
    }

    /// Reject malformed policies before they are stored
    pub fn validate(&self) -> Result<()> {
        if self.policy_id.is_empty() {
            return Err(GatewayError::Validation(
                "Policy id cannot be empty".to_string(),
            ));
        }
        if self.client_id.is_empty() || self.endpoint.is_empty() {
            return Err(GatewayError::Validation(format!(
                "Policy {} must name a client id and an endpoint (or '*')",
                self.policy_id
            )));
        }
        if self.max_requests == 0 {
            return Err(GatewayError::Validation(format!(
                "Policy {} max_requests must be > 0",
                self.policy_id
            )));
        }
        if self.time_window_seconds == 0 {
            return Err(GatewayError::Validation(format!(
                "Policy {} time_window_seconds must be > 0",
                self.policy_id
            )));
        }
        if self.burst_capacity == Some(0) {
            return Err(GatewayError::Validation(format!(
                "Policy {} burst_capacity must be > 0",
                self.policy_id
            )));
        }
        if let Some(rate) = self.refill_rate_per_second {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(GatewayError::Validation(format!(
                    "Policy {} refill_rate_per_second must be > 0",
                    self.policy_id
                )));
            }
        }
        Ok(())
    }

    pub fn window_ms(&self) -> u64 {
        self.time_window_seconds.saturating_mul(1000)
    }

    /// Token bucket capacity
    pub fn capacity(&self) -> u64 {
        self.burst_capacity.unwrap_or(self.max_requests)
    }

    /// Largest weight a single check can ever be granted
    pub fn max_weight(&self) -> u64 {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => self.capacity(),
            _ => self.max_requests,
        }
    }

    /// Token bucket refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate_per_second
            .unwrap_or(self.max_requests as f64 / self.time_window_seconds as f64)
    }

    /// Whether this policy is eligible for `subject`
    pub fn applies_to(&self, subject: &RateLimitSubject<'_>) -> bool {
        if !self.is_active {
            return false;
        }
        if self.client_id != ANY && self.client_id != subject.client_id {
            return false;
        }
        if self.endpoint != ANY && self.endpoint != subject.endpoint {
            return false;
        }
        if let Some(key) = &self.api_key {
            if subject.api_key != Some(key.as_str()) {
                return false;
            }
        }
        if let Some(tenant) = &self.tenant_id {
            if subject.tenant_id != Some(tenant.as_str()) {
                return false;
            }
        }
        true
    }

    /// Number of wildcard scopes; fewer is more specific
    pub(crate) fn wildcards(&self) -> u8 {
        (self.client_id == ANY) as u8 + (self.endpoint == ANY) as u8
    }
}

/// Who is being limited, and where
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSubject<'a> {
    pub client_id: &'a str,
    pub endpoint: &'a str,
    pub api_key: Option<&'a str>,
    pub tenant_id: Option<&'a str>,
}

impl<'a> RateLimitSubject<'a> {
    pub fn new(client_id: &'a str, endpoint: &'a str) -> Self {
        Self {
            client_id,
            endpoint,
            api_key: None,
            tenant_id: None,
        }
    }

    /// Store key: one counter per algorithm, client and endpoint
    pub fn store_key(&self, prefix: &str, algorithm: RateLimitAlgorithm) -> String {
        format!(
            "{}:{}:{}:{}",
            prefix,
            algorithm.as_str(),
            self.client_id,
            self.endpoint
        )
    }
}

/// Raw result of one atomic store evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_after_secs: u64,
}

impl StoreOutcome {
    /// Denial for a weight above [`RateLimitPolicy::max_weight`]; no state is touched
    pub fn oversized(policy: &RateLimitPolicy) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_after_secs: policy.time_window_seconds.max(1),
        }
    }

    /// Decode the `{allowed, remaining, reset_after}` triple returned by the scripts
    pub fn from_script_reply(reply: &[i64]) -> Result<Self> {
        match reply {
            [allowed, remaining, reset_after, ..] => Ok(Self {
                allowed: *allowed == 1,
                remaining: (*remaining).max(0) as u64,
                reset_after_secs: (*reset_after).max(0) as u64,
            }),
            _ => Err(GatewayError::RateLimitStoreUnavailable(format!(
                "unexpected script reply: {:?}",
                reply
            ))),
        }
    }
}

/// Rate limit decision returned to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_after_secs: u64,
    pub window_secs: u64,
    pub algorithm: Option<RateLimitAlgorithm>,
    pub policy_id: Option<String>,
    /// Allowed because the store could not be consulted
    pub fail_open: bool,
}

impl RateLimitDecision {
    /// No policy applies
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_after_secs: 0,
            window_secs: 0,
            algorithm: None,
            policy_id: None,
            fail_open: false,
        }
    }

    pub fn from_outcome(policy: &RateLimitPolicy, outcome: StoreOutcome) -> Self {
        Self {
            allowed: outcome.allowed,
            limit: policy.max_requests,
            remaining: if outcome.allowed { outcome.remaining } else { 0 },
            reset_after_secs: outcome.reset_after_secs,
            window_secs: policy.time_window_seconds,
            algorithm: Some(policy.algorithm),
            policy_id: Some(policy.policy_id.clone()),
            fail_open: false,
        }
    }

    /// The store was unavailable; the request proceeds
    pub fn fail_open(policy: &RateLimitPolicy) -> Self {
        Self {
            allowed: true,
            limit: policy.max_requests,
            remaining: policy.max_requests,
            reset_after_secs: policy.time_window_seconds,
            window_secs: policy.time_window_seconds,
            algorithm: Some(policy.algorithm),
            policy_id: Some(policy.policy_id.clone()),
            fail_open: true,
        }
    }

    /// Whether a policy was evaluated (decisions without one carry no headers)
    pub fn is_limited(&self) -> bool {
        self.policy_id.is_some()
    }

    /// Seconds a denied client should wait
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_after_secs.max(1)
    }
}
