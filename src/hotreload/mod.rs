use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::rate_limit::policy::InMemoryPolicyStore;
use crate::repository::InMemoryRouteRepository;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Hot reload configuration
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct HotReloadConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Quiet period after the last file event before reloading
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce_ms(),
        }
    }
}

/// Counts applied by one reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub routes: usize,
    pub policies: usize,
}

/// Watches the configuration file and replaces the seeded routes and
/// policies whenever it changes.
///
/// Route replacement fires a change notification, which invalidates the
/// route cache through its listener.
pub struct HotReloadService {
    config_path: PathBuf,
    routes: Arc<InMemoryRouteRepository>,
    policies: Arc<InMemoryPolicyStore>,
    debounce_duration: Duration,
}

impl HotReloadService {
    pub fn new(
        config_path: PathBuf,
        routes: Arc<InMemoryRouteRepository>,
        policies: Arc<InMemoryPolicyStore>,
        debounce_ms: u64,
    ) -> Self {
        Self {
            config_path,
            routes,
            policies,
            debounce_duration: Duration::from_millis(debounce_ms),
        }
    }

    /// Re-read the file and apply it. A file that fails to load or validate
    /// leaves the current routes and policies untouched.
    pub fn reload(&self) -> Result<ReloadSummary> {
        info!(path = %self.config_path.display(), "Reloading routes and policies");

        let config = GatewayConfig::from_file(&self.config_path)?;
        config.validate()?;

        let summary = ReloadSummary {
            routes: config.routes.len(),
            policies: config.policies.len(),
        };
        self.routes.replace_all(config.routes)?;
        self.policies.replace_all(config.policies)?;
        Ok(summary)
    }

    /// Start watching; the returned task owns the watcher
    pub fn start(self) -> Result<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::channel::<Event>(100);

        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = tx.blocking_send(event);
                    }
                }
            },
            Config::default(),
        )
        .map_err(|e| GatewayError::Internal(format!("Failed to create file watcher: {}", e)))?;

        // Editors often replace the file, so watch its directory.
        let watch_dir = watch_directory(&self.config_path);
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::Internal(format!("Failed to watch config file: {}", e)))?;

        info!(
            path = %self.config_path.display(),
            debounce_ms = self.debounce_duration.as_millis() as u64,
            "Hot reload watcher started"
        );

        Ok(tokio::spawn(async move {
            let _watcher = watcher;

            while let Some(event) = rx.recv().await {
                if !self.concerns_config(&event) {
                    continue;
                }
                debug!(kind = ?event.kind, "Config file change detected");

                // Wait for the writes to settle, then collapse queued events
                tokio::time::sleep(self.debounce_duration).await;
                while rx.try_recv().is_ok() {}

                match self.reload() {
                    Ok(summary) => info!(
                        routes = summary.routes,
                        policies = summary.policies,
                        "Configuration reloaded successfully"
                    ),
                    Err(e) => error!(
                        error = %e,
                        "Failed to reload configuration, keeping current routes"
                    ),
                }
            }
        }))
    }

    fn concerns_config(&self, event: &Event) -> bool {
        let name = self.config_path.file_name();
        event.paths.iter().any(|p| p.file_name() == name)
    }
}

fn watch_directory(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
