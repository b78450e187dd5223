use crate::cache::RouteCacheConfig;
use crate::context::IdentityConfig;
use crate::error::{GatewayError, Result};
use crate::hotreload::HotReloadConfig;
use crate::rate_limit::types::RateLimitPolicy;
use crate::rate_limit::RateLimitSettings;
use crate::route::{Route, RouteDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Environment variables with this prefix override file values,
/// e.g. `GATEWAY__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "GATEWAY";

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub route_cache: RouteCacheConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
    #[serde(default)]
    pub passthrough: PassthroughConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub hot_reload: HotReloadConfig,
    /// Seed routes for the in-memory repository
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
    /// Seed rate limit policies
    #[serde(default)]
    pub policies: Vec<RateLimitPolicy>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Backend request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Port of the administrative API (routes, policies, health, metrics)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    /// Largest request body the gateway buffers; larger bodies get 413
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Handling of requests no route matches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassthroughConfig {
    /// Forward unmatched requests here unmodified; without it they get 404
    #[serde(default)]
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before a target is treated as unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: usize,
    /// Cooldown before an unhealthy target receives a trial request
    #[serde(default = "default_recovery_ms")]
    pub recovery_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

fn default_admin_port() -> u16 {
    9090
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_unhealthy_threshold() -> usize {
    3
}

fn default_recovery_ms() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
            admin_port: default_admin_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: default_unhealthy_threshold(),
            recovery_ms: default_recovery_ms(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, then apply `GATEWAY__*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<GatewayConfig>())
            .map_err(|e| {
                GatewayError::Config(format!(
                    "Failed to load config from {}: {}",
                    path.display(),
                    e
                ))
            })
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 || self.server.admin_port == 0 {
            return Err(GatewayError::Config("Ports must be non-zero".to_string()));
        }
        if self.server.port == self.server.admin_port {
            return Err(GatewayError::Config(format!(
                "Admin port {} collides with the gateway port",
                self.server.admin_port
            )));
        }
        if self.server.timeout_secs == 0 {
            return Err(GatewayError::Config(
                "Backend timeout must be > 0".to_string(),
            ));
        }
        if self.route_cache.ttl_secs == 0 || self.route_cache.repository_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "Route cache TTL and repository timeout must be > 0".to_string(),
            ));
        }
        if self.rate_limiting.store_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "Rate limit store timeout must be > 0".to_string(),
            ));
        }
        if let Some(upstream) = &self.passthrough.upstream {
            if !upstream.starts_with("http://") && !upstream.starts_with("https://") {
                return Err(GatewayError::Config(format!(
                    "Passthrough upstream must start with http:// or https://: {}",
                    upstream
                )));
            }
        }

        let mut route_ids = HashSet::new();
        for definition in &self.routes {
            Route::new(definition.clone())?;
            if !route_ids.insert(definition.route_id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate route id: {}",
                    definition.route_id
                )));
            }
        }

        let mut policy_ids = HashSet::new();
        for policy in &self.policies {
            policy.validate()?;
            if !policy_ids.insert(policy.policy_id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate policy id: {}",
                    policy.policy_id
                )));
            }
        }

        Ok(())
    }
}
