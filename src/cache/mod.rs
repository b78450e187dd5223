//! Route cache.
//!
//! The ordered active route set is read from the repository at most once per
//! TTL and invalidation generation; concurrent misses share that one call.
//! Candidate routes per (method, path) are derived from the set without
//! touching the repository and kept in a second, capacity-bounded cache. The
//! last route set read successfully is kept as an immutable snapshot and
//! answers lookups while the repository is unavailable.

use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::repository::{RouteChange, RouteRepository};
use crate::route::{route_order, Route};
use arc_swap::ArcSwapOption;
use http::Method;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ordered candidate routes for one lookup
pub type RouteList = Arc<Vec<Arc<Route>>>;

/// Route cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCacheConfig {
    /// Time-to-live for the route set and cached lookups in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of (method, path) entries
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
    /// Upper bound on one repository round-trip
    #[serde(default = "default_repository_timeout_ms")]
    pub repository_timeout_ms: u64,
}

fn default_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_capacity() -> u64 {
    10_000
}

fn default_repository_timeout_ms() -> u64 {
    500
}

impl Default for RouteCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_capacity: default_max_capacity(),
            repository_timeout_ms: default_repository_timeout_ms(),
        }
    }
}

/// Cache key: request method and path, tagged with the invalidation generation
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
struct LookupKey {
    generation: u64,
    method: Method,
    path: String,
}

/// Read-through, TTL-bounded cache of candidate routes
pub struct RouteCache {
    repository: Arc<dyn RouteRepository>,
    /// Ordered active routes, keyed by generation
    route_sets: Cache<u64, RouteList>,
    entries: Cache<LookupKey, RouteList>,
    last_known_good: ArcSwapOption<Vec<Arc<Route>>>,
    generation: AtomicU64,
    repository_timeout: Duration,
}

impl RouteCache {
    pub fn new(repository: Arc<dyn RouteRepository>, config: &RouteCacheConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_secs);
        let route_sets = Cache::builder().max_capacity(4).time_to_live(ttl).build();
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(ttl)
            .build();

        info!(
            ttl_secs = config.ttl_secs,
            max_capacity = config.max_capacity,
            "Initialized route cache"
        );

        Self {
            repository,
            route_sets,
            entries,
            last_known_good: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            repository_timeout: Duration::from_millis(config.repository_timeout_ms),
        }
    }

    /// Candidate routes for `method` + `path`, highest priority first.
    ///
    /// Header, query and body conditions are not applied here. With the
    /// repository down and no snapshot yet, the list is empty.
    pub async fn lookup(&self, method: &Method, path: &str) -> RouteList {
        let generation = self.generation.load(Ordering::Acquire);
        let key = LookupKey {
            generation,
            method: method.clone(),
            path: path.to_string(),
        };

        if let Some(routes) = self.entries.get(&key).await {
            metrics::record_route_cache_lookup("hit");
            return routes;
        }

        let route_set = match self.route_sets.get(&generation).await {
            Some(route_set) => {
                metrics::record_route_cache_lookup("hit");
                route_set
            }
            None => {
                let loaded = self
                    .route_sets
                    .try_get_with(generation, async { self.load(generation).await })
                    .await;
                match loaded {
                    Ok(route_set) => {
                        metrics::record_route_cache_lookup("miss");
                        route_set
                    }
                    Err(e) => {
                        warn!(method = %method, path, error = %e, "Route repository unavailable");
                        return self.from_snapshot(method, path);
                    }
                }
            }
        };

        let routes = candidates(&route_set, method, path);
        self.entries.insert(key, Arc::clone(&routes)).await;
        routes
    }

    /// Drop the route set and every cached lookup. The snapshot is kept so a
    /// failing repository still has something to fall back to.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.route_sets.invalidate_all();
        self.entries.invalidate_all();
        debug!("Route cache invalidated");
    }

    /// Number of cached lookups (approximate)
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Whether a last-known-good route set is available
    pub fn has_snapshot(&self) -> bool {
        self.last_known_good.load().is_some()
    }

    /// Invalidate on every repository change notification
    pub fn spawn_invalidation_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut changes = self.repository.subscribe();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        debug!(?change, "Route change received");
                        cache.invalidate();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Route change notifications lagged");
                        cache.invalidate();
                    }
                    Err(RecvError::Closed) => {
                        info!("Route change channel closed, stopping cache listener");
                        break;
                    }
                }
            }
        })
    }

    async fn load(&self, generation: u64) -> Result<RouteList> {
        let active = tokio::time::timeout(self.repository_timeout, self.repository.list_active_routes())
            .await
            .map_err(|_| {
                GatewayError::RouteRepositoryUnavailable(format!(
                    "no answer within {}ms",
                    self.repository_timeout.as_millis()
                ))
            })??;

        let mut route_set = active;
        route_set.sort_by(|a, b| route_order(a, b));
        let route_set = Arc::new(route_set);

        // A load that raced an invalidation must not replace a newer snapshot
        if self.generation.load(Ordering::Acquire) == generation {
            self.last_known_good.store(Some(Arc::clone(&route_set)));
        } else {
            debug!(generation, "Discarding snapshot from a superseded load");
        }

        Ok(route_set)
    }

    fn from_snapshot(&self, method: &Method, path: &str) -> RouteList {
        match self.last_known_good.load_full() {
            Some(snapshot) => {
                metrics::record_route_cache_lookup("stale");
                candidates(&snapshot, method, path)
            }
            None => {
                metrics::record_route_cache_lookup("unavailable");
                Arc::new(Vec::new())
            }
        }
    }
}

/// Routes of an ordered set that could serve `method` + `path`
fn candidates(ordered: &[Arc<Route>], method: &Method, path: &str) -> RouteList {
    Arc::new(
        ordered
            .iter()
            .filter(|r| r.matches_method_and_path(method, path))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRouteRepository;
    use crate::route::tests::target;
    use crate::route::RouteDefinition;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::broadcast;

    /// Wraps the in-memory repository, counting calls and optionally failing
    struct CountingRepository {
        inner: InMemoryRouteRepository,
        calls: AtomicUsize,
        failing: AtomicBool,
    }

    impl CountingRepository {
        fn new(definitions: Vec<RouteDefinition>) -> Self {
            Self {
                inner: InMemoryRouteRepository::with_routes(definitions).unwrap(),
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RouteRepository for CountingRepository {
        async fn list_active_routes(&self) -> Result<Vec<Arc<Route>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(GatewayError::RouteRepositoryUnavailable("down".to_string()));
            }
            self.inner.list_active_routes().await
        }

        fn subscribe(&self) -> broadcast::Receiver<RouteChange> {
            self.inner.subscribe()
        }
    }

    fn definitions() -> Vec<RouteDefinition> {
        let mut high = RouteDefinition::new("high", "/api/orders/*", vec![target("a", 1, true)]);
        high.priority = 10;
        let low = RouteDefinition::new("low", "/api/**", vec![target("b", 1, true)]);
        let mut post_only = RouteDefinition::new("post", "/api/orders/*", vec![target("c", 1, true)]);
        post_only.http_method = Some("POST".to_string());
        vec![low, high, post_only]
    }

    fn ids(routes: &RouteList) -> Vec<&str> {
        routes.iter().map(|r| r.id()).collect()
    }

    #[tokio::test]
    async fn test_lookup_orders_candidates() {
        let repository = Arc::new(CountingRepository::new(definitions()));
        let cache = RouteCache::new(repository, &RouteCacheConfig::default());

        let routes = cache.lookup(&Method::GET, "/api/orders/7").await;
        assert_eq!(ids(&routes), vec!["high", "low"]);

        let routes = cache.lookup(&Method::POST, "/api/orders/7").await;
        assert_eq!(ids(&routes), vec!["high", "low", "post"]);

        let routes = cache.lookup(&Method::GET, "/health").await;
        assert!(routes.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_lookups_hit_the_cache() {
        let repository = Arc::new(CountingRepository::new(definitions()));
        let cache = RouteCache::new(repository.clone(), &RouteCacheConfig::default());

        let first = cache.lookup(&Method::GET, "/api/orders/7").await;
        for _ in 0..10 {
            let again = cache.lookup(&Method::GET, "/api/orders/7").await;
            assert_eq!(ids(&again), ids(&first));
        }
        assert_eq!(repository.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_load() {
        let repository = Arc::new(CountingRepository::new(definitions()));
        let cache = Arc::new(RouteCache::new(repository.clone(), &RouteCacheConfig::default()));

        let lookups = (0..16).map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.lookup(&Method::GET, "/api/orders/1").await.len() })
        });
        for result in futures::future::join_all(lookups).await {
            assert_eq!(result.unwrap(), 2);
        }
        assert_eq!(repository.calls(), 1);
    }

    #[tokio::test]
    async fn test_change_notification_invalidates() {
        let repository = Arc::new(CountingRepository::new(definitions()));
        let cache = Arc::new(RouteCache::new(repository.clone(), &RouteCacheConfig::default()));
        let listener = cache.spawn_invalidation_listener();

        assert_eq!(cache.lookup(&Method::GET, "/api/orders/7").await.len(), 2);

        repository.inner.delete("high").unwrap();

        // Wait for the listener to process the notification
        let mut remaining = 2;
        for _ in 0..50 {
            remaining = cache.lookup(&Method::GET, "/api/orders/7").await.len();
            if remaining == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining, 1);
        listener.abort();
    }

    #[tokio::test]
    async fn test_ttl_expiry_reloads() {
        let repository = Arc::new(CountingRepository::new(definitions()));
        let config = RouteCacheConfig {
            ttl_secs: 1,
            ..Default::default()
        };
        let cache = RouteCache::new(repository.clone(), &config);

        cache.lookup(&Method::GET, "/api/orders/7").await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        cache.lookup(&Method::GET, "/api/orders/7").await;
        assert_eq!(repository.calls(), 2);
    }

    #[tokio::test]
    async fn test_repository_failure_serves_last_known_good() {
        let repository = Arc::new(CountingRepository::new(definitions()));
        let cache = RouteCache::new(repository.clone(), &RouteCacheConfig::default());

        assert_eq!(cache.lookup(&Method::GET, "/api/orders/7").await.len(), 2);
        assert!(cache.has_snapshot());

        repository.failing.store(true, Ordering::SeqCst);
        cache.invalidate();

        // Different path, never cached, answered from the snapshot
        let routes = cache.lookup(&Method::GET, "/api/users").await;
        assert_eq!(ids(&routes), vec!["low"]);
    }

    #[tokio::test]
    async fn test_repository_failure_without_snapshot_is_empty() {
        let repository = Arc::new(CountingRepository::new(definitions()));
        repository.failing.store(true, Ordering::SeqCst);
        let cache = RouteCache::new(repository, &RouteCacheConfig::default());

        assert!(cache.lookup(&Method::GET, "/api/orders/7").await.is_empty());
        assert!(!cache.has_snapshot());
    }

    #[tokio::test]
    async fn test_distinct_paths_share_one_repository_read() {
        let repository = Arc::new(CountingRepository::new(definitions()));
        let cache = RouteCache::new(repository.clone(), &RouteCacheConfig::default());

        for id in 0..200 {
            let routes = cache.lookup(&Method::GET, &format!("/api/orders/{}", id)).await;
            assert_eq!(ids(&routes), vec!["high", "low"]);
        }
        assert_eq!(repository.calls(), 1);
    }

    /// First call blocks until released and answers with `old`; later calls
    /// answer with `new`, or fail once `failing` is set
    struct SlowFirstRepository {
        old: InMemoryRouteRepository,
        new: InMemoryRouteRepository,
        calls: AtomicUsize,
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
        failing: AtomicBool,
    }

    #[async_trait]
    impl RouteRepository for SlowFirstRepository {
        async fn list_active_routes(&self) -> Result<Vec<Arc<Route>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                self.release.notified().await;
                return self.old.list_active_routes().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(GatewayError::RouteRepositoryUnavailable("down".to_string()));
            }
            self.new.list_active_routes().await
        }

        fn subscribe(&self) -> broadcast::Receiver<RouteChange> {
            self.new.subscribe()
        }
    }

    #[tokio::test]
    async fn test_superseded_load_keeps_newer_snapshot() {
        let repository = Arc::new(SlowFirstRepository {
            old: InMemoryRouteRepository::with_routes(vec![RouteDefinition::new(
                "old",
                "/api/**",
                vec![target("a", 1, true)],
            )])
            .unwrap(),
            new: InMemoryRouteRepository::with_routes(vec![RouteDefinition::new(
                "new",
                "/api/**",
                vec![target("b", 1, true)],
            )])
            .unwrap(),
            calls: AtomicUsize::new(0),
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
            failing: AtomicBool::new(false),
        });
        let config = RouteCacheConfig {
            repository_timeout_ms: 5_000,
            ..Default::default()
        };
        let cache = Arc::new(RouteCache::new(repository.clone(), &config));

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.lookup(&Method::GET, "/api/x").await })
        };
        repository.started.notified().await;

        cache.invalidate();
        assert_eq!(ids(&cache.lookup(&Method::GET, "/api/x").await), vec!["new"]);

        repository.release.notify_one();
        assert_eq!(ids(&slow.await.unwrap()), vec!["old"]);

        repository.failing.store(true, Ordering::SeqCst);
        cache.invalidate();
        assert_eq!(ids(&cache.lookup(&Method::GET, "/api/y").await), vec!["new"]);
    }
}
