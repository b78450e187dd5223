use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health signal consumed by the FAILOVER strategy
pub trait HealthSource: Send + Sync {
    /// Unknown services are treated as healthy
    fn is_healthy(&self, service_id: &str) -> bool;

    /// Whether the next request may go to this service. Unlike
    /// [`is_healthy`](Self::is_healthy) this may let a trial request through
    /// to an unhealthy service.
    fn admit(&self, service_id: &str) -> bool {
        self.is_healthy(service_id)
    }
}

/// Health status of a target service
#[derive(Debug, Default)]
struct HealthStatus {
    /// `true` means unhealthy - the zero value reads as healthy
    unhealthy: AtomicBool,
    /// Set by an administrative override; no trial requests while pinned
    pinned: AtomicBool,
    consecutive_failures: AtomicUsize,
    /// Registry-relative millis of the last failure or trial admission
    last_trial_ms: AtomicU64,
}

/// Passive health registry keyed by target service id.
///
/// Fed by forwarding outcomes and by the administrative API. An unhealthy
/// service gets one trial request per `recovery_after`; a successful trial
/// marks it healthy again.
#[derive(Debug)]
pub struct HealthRegistry {
    states: DashMap<String, HealthStatus>,
    unhealthy_threshold: usize,
    recovery_after: Duration,
    epoch: Instant,
}

impl HealthRegistry {
    pub fn new(unhealthy_threshold: usize) -> Self {
        Self::with_recovery(unhealthy_threshold, Duration::from_secs(30))
    }

    pub fn with_recovery(unhealthy_threshold: usize, recovery_after: Duration) -> Self {
        Self {
            states: DashMap::new(),
            unhealthy_threshold: unhealthy_threshold.max(1),
            recovery_after,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record a successful backend call
    pub fn record_success(&self, service_id: &str) {
        let entry = self.states.entry(service_id.to_string()).or_default();
        entry.consecutive_failures.store(0, Ordering::Relaxed);
        if entry.unhealthy.swap(false, Ordering::Relaxed) {
            info!(service_id, "Target service marked healthy");
        }
    }

    /// Record a failed backend call (5xx or transport error)
    pub fn record_failure(&self, service_id: &str) {
        let entry = self.states.entry(service_id.to_string()).or_default();
        let failures = entry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.unhealthy_threshold {
            return;
        }
        // Restart the cooldown, also after a failed trial
        entry.last_trial_ms.store(self.now_ms(), Ordering::Relaxed);
        if !entry.unhealthy.swap(true, Ordering::Relaxed) {
            warn!(
                service_id,
                consecutive_failures = failures,
                "Target service marked unhealthy"
            );
        }
    }

    /// Force a health state (administrative override)
    pub fn set_health(&self, service_id: &str, healthy: bool) {
        let entry = self.states.entry(service_id.to_string()).or_default();
        entry.consecutive_failures.store(0, Ordering::Relaxed);
        entry.unhealthy.store(!healthy, Ordering::Relaxed);
        entry.pinned.store(!healthy, Ordering::Relaxed);
        info!(service_id, healthy, "Target service health set");
    }

    /// Snapshot of (service id, healthy) pairs
    pub fn snapshot(&self) -> Vec<(String, bool)> {
        let mut all: Vec<(String, bool)> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), !e.value().unhealthy.load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(3)
    }
}

impl HealthSource for HealthRegistry {
    fn is_healthy(&self, service_id: &str) -> bool {
        self.states
            .get(service_id)
            .map(|s| !s.unhealthy.load(Ordering::Relaxed))
            .unwrap_or(true)
    }

    fn admit(&self, service_id: &str) -> bool {
        let Some(status) = self.states.get(service_id) else {
            return true;
        };
        if !status.unhealthy.load(Ordering::Relaxed) {
            return true;
        }
        if status.pinned.load(Ordering::Relaxed) {
            return false;
        }

        let now = self.now_ms();
        let last = status.last_trial_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.recovery_after.as_millis() as u64 {
            return false;
        }
        // Exactly one caller wins the trial for this cooldown period
        let won = status
            .last_trial_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if won {
            debug!(service_id, "Admitting trial request to unhealthy service");
        }
        won
    }
}
