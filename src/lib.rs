pub mod admin;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod hotreload;
pub mod matcher;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod repository;
pub mod route;
pub mod selector;
pub mod transform;

use crate::admin::AdminState;
use crate::cache::RouteCache;
use crate::config::{GatewayConfig, LogFormat};
use crate::context::ContextBuilder;
use crate::error::{GatewayError, Result};
use crate::hotreload::HotReloadService;
use crate::metrics::MetricsService;
use crate::pipeline::GatewayPipeline;
use crate::proxy::Forwarder;
use crate::rate_limit::clock::SystemClock;
use crate::rate_limit::local::MemoryStore;
use crate::rate_limit::policy::InMemoryPolicyStore;
use crate::rate_limit::redis::RedisStore;
use crate::rate_limit::{RateLimitStore, RateLimiterService};
use crate::repository::InMemoryRouteRepository;
use crate::selector::{HealthRegistry, TargetSelector};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Wired gateway components
pub struct Gateway {
    pub pipeline: GatewayPipeline,
    pub admin: AdminState,
}

impl Gateway {
    /// Public router, every request goes through the pipeline
    pub fn public_router(&self) -> axum::Router {
        pipeline::router(self.pipeline.clone()).layer(TraceLayer::new_for_http())
    }

    pub fn admin_router(&self) -> axum::Router {
        admin::router(self.admin.clone()).layer(TraceLayer::new_for_http())
    }

    pub fn routes(&self) -> &Arc<InMemoryRouteRepository> {
        &self.admin.routes
    }

    pub fn policies(&self) -> &Arc<InMemoryPolicyStore> {
        &self.admin.policies
    }
}

/// Build every component from configuration. Must run inside a Tokio runtime.
pub async fn build_gateway(config: &GatewayConfig, metrics: MetricsService) -> Result<Gateway> {
    let routes = Arc::new(InMemoryRouteRepository::with_routes(config.routes.clone())?);
    let policies = Arc::new(InMemoryPolicyStore::with_policies(
        config.policies.clone(),
    )?);
    info!(
        routes = config.routes.len(),
        policies = config.policies.len(),
        "Loaded seed configuration"
    );

    let cache = Arc::new(RouteCache::new(routes.clone(), &config.route_cache));
    cache.spawn_invalidation_listener();

    let store: Arc<dyn RateLimitStore> = match &config.rate_limiting.redis {
        Some(redis) => Arc::new(RedisStore::connect(&redis.url).await?),
        None => {
            warn!("No Redis configured, rate limits are enforced per gateway instance");
            Arc::new(MemoryStore::new())
        }
    };
    let rate_limiter = Arc::new(RateLimiterService::with_settings(
        policies.clone(),
        store,
        Arc::new(SystemClock),
        config.rate_limiting.clone(),
    ));

    let health = Arc::new(HealthRegistry::with_recovery(
        config.health.unhealthy_threshold,
        Duration::from_millis(config.health.recovery_ms),
    ));
    let forwarder = Forwarder::new(Duration::from_secs(config.server.timeout_secs))?;

    let pipeline = GatewayPipeline {
        cache: cache.clone(),
        contexts: Arc::new(ContextBuilder::new(config.identity.clone())),
        rate_limiter,
        selector: TargetSelector::new(health.clone()),
        health: health.clone(),
        forwarder,
        passthrough_upstream: config.passthrough.upstream.clone(),
        max_body_bytes: config.server.max_body_bytes,
    };

    let admin = AdminState {
        routes,
        policies,
        cache,
        health,
        metrics,
    };

    Ok(Gateway { pipeline, admin })
}

/// Initialize the gateway server and the admin server
pub async fn init_gateway(config: GatewayConfig, config_path: Option<PathBuf>) -> Result<()> {
    config.validate()?;

    info!("Starting API Gateway");

    let metrics = MetricsService::new()?;
    let gateway = build_gateway(&config, metrics).await?;

    if config.hot_reload.enabled {
        match config_path {
            Some(path) => {
                HotReloadService::new(
                    path,
                    gateway.routes().clone(),
                    gateway.policies().clone(),
                    config.hot_reload.debounce_ms,
                )
                .start()?;
            }
            None => warn!("Hot reload enabled but no config file path given"),
        }
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let admin_addr = format!("{}:{}", config.server.host, config.server.admin_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(&admin_addr).await?;

    info!(%addr, %admin_addr, "Gateway ready to accept connections");

    let public = axum::serve(
        listener,
        gateway
            .public_router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    );
    let admin = axum::serve(admin_listener, gateway.admin_router());

    tokio::try_join!(async { public.await }, async { admin.await })
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

/// Initialize tracing/logging
pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "routing_gateway=debug,tower_http=debug".into());

    match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
}
