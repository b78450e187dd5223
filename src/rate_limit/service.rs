use super::clock::{Clock, SystemClock};
use super::policy::PolicySource;
use super::types::{RateLimitDecision, RateLimitPolicy, RateLimitSubject, StoreOutcome};
use super::RateLimitStore;
use crate::error::GatewayError;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Redis connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Shared store; without it quotas are kept per instance
    #[serde(default)]
    pub redis: Option<RedisSettings>,
    /// Upper bound on one store round-trip before failing open
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_enabled() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_key_prefix() -> String {
    "gateway:ratelimit".to_string()
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            redis: None,
            store_timeout_ms: default_store_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Resolves the applicable policy and evaluates it against the store
pub struct RateLimiterService {
    policies: Arc<dyn PolicySource>,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    settings: RateLimitSettings,
}

impl RateLimiterService {
    /// Service with default settings and the system clock
    pub fn new(policies: Arc<dyn PolicySource>, store: Arc<dyn RateLimitStore>) -> Self {
        Self::with_settings(policies, store, Arc::new(SystemClock), RateLimitSettings::default())
    }

    pub fn with_settings(
        policies: Arc<dyn PolicySource>,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        settings: RateLimitSettings,
    ) -> Self {
        info!(
            store = store.name(),
            enabled = settings.enabled,
            store_timeout_ms = settings.store_timeout_ms,
            "Initializing rate limiter"
        );
        Self {
            policies,
            store,
            clock,
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Check `weight` units of quota for `client_id` on `endpoint`
    pub async fn check(&self, client_id: &str, endpoint: &str, weight: u64) -> RateLimitDecision {
        self.check_subject(&RateLimitSubject::new(client_id, endpoint), weight)
            .await
    }

    /// Check with API key / tenant scoping.
    ///
    /// Never fails: an unreachable policy source or store allows the request.
    pub async fn check_subject(
        &self,
        subject: &RateLimitSubject<'_>,
        weight: u64,
    ) -> RateLimitDecision {
        if !self.settings.enabled {
            return RateLimitDecision::unlimited();
        }

        let policy = match self.policies.resolve_policy(subject).await {
            Ok(Some(policy)) => policy,
            Ok(None) => return RateLimitDecision::unlimited(),
            Err(e) => {
                warn!(
                    client_id = subject.client_id,
                    endpoint = subject.endpoint,
                    reason = %e,
                    "Policy source unavailable, failing open"
                );
                metrics::record_rate_limit_fail_open("policy_source");
                return RateLimitDecision::unlimited();
            }
        };

        let weight = weight.max(1);
        let decision = if weight > policy.max_weight() {
            warn!(
                client_id = subject.client_id,
                endpoint = subject.endpoint,
                policy_id = %policy.policy_id,
                weight,
                max_weight = policy.max_weight(),
                "Weight exceeds policy limit, denying"
            );
            RateLimitDecision::from_outcome(&policy, StoreOutcome::oversized(&policy))
        } else {
            self.evaluate(subject, &policy, weight).await
        };
        metrics::record_rate_limit_decision(
            policy.algorithm.as_str(),
            match (decision.fail_open, decision.allowed) {
                (true, _) => "fail_open",
                (false, true) => "allowed",
                (false, false) => "denied",
            },
        );
        decision
    }

    async fn evaluate(
        &self,
        subject: &RateLimitSubject<'_>,
        policy: &RateLimitPolicy,
        weight: u64,
    ) -> RateLimitDecision {
        let key = subject.store_key(&self.settings.key_prefix, policy.algorithm);
        let now_ms = self.clock.now_ms();
        let timeout = Duration::from_millis(self.settings.store_timeout_ms);

        let evaluation = self.store.evaluate(&key, policy, weight, now_ms);
        let result = match tokio::time::timeout(timeout, evaluation).await {
            Ok(result) => result.map_err(|e| ("store_error", e)),
            Err(_) => Err((
                "timeout",
                GatewayError::RateLimitStoreUnavailable(format!(
                    "no answer within {}ms",
                    self.settings.store_timeout_ms
                )),
            )),
        };

        match result {
            Ok(outcome) => {
                let decision = RateLimitDecision::from_outcome(policy, outcome);
                debug!(
                    client_id = subject.client_id,
                    endpoint = subject.endpoint,
                    policy_id = %policy.policy_id,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "Rate limit checked"
                );
                decision
            }
            Err((reason, e)) => {
                warn!(
                    client_id = subject.client_id,
                    endpoint = subject.endpoint,
                    policy_id = %policy.policy_id,
                    store = self.store.name(),
                    reason,
                    error = %e,
                    "Rate limit store unavailable, failing open"
                );
                metrics::record_rate_limit_fail_open(reason);
                RateLimitDecision::fail_open(policy)
            }
        }
    }
}
