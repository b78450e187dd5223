//! Route repository adapter.
//!
//! The gateway core never persists routes itself: it reads them through
//! [`RouteRepository`] and reacts to change notifications. The in-memory
//! implementation backs the administrative API, the configuration seed and
//! hot reload.

use crate::error::{GatewayError, Result};
use crate::route::{Route, RouteDefinition};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// A change to the stored route set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteChange {
    Upserted(String),
    Deleted(String),
    /// The whole route set was replaced
    Reloaded,
}

/// Source of route configuration
#[async_trait]
pub trait RouteRepository: Send + Sync {
    /// All routes that are enabled and ACTIVE
    async fn list_active_routes(&self) -> Result<Vec<Arc<Route>>>;

    /// Subscribe to change notifications
    fn subscribe(&self) -> broadcast::Receiver<RouteChange>;
}

/// Route repository held in process memory
pub struct InMemoryRouteRepository {
    routes: DashMap<String, Arc<Route>>,
    changes: broadcast::Sender<RouteChange>,
}

impl InMemoryRouteRepository {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            routes: DashMap::new(),
            changes,
        }
    }

    /// Build a repository seeded with `definitions`
    pub fn with_routes(definitions: Vec<RouteDefinition>) -> Result<Self> {
        let repository = Self::new();
        repository.replace_all(definitions)?;
        Ok(repository)
    }

    /// Register a new route. The route id must be unused.
    pub fn create(&self, mut definition: RouteDefinition) -> Result<Arc<Route>> {
        let now = Utc::now();
        definition.version = 1;
        definition.created_at = now;
        definition.updated_at = now;
        let route = Arc::new(Route::new(definition)?);

        match self.routes.entry(route.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GatewayError::Conflict(format!(
                    "Route {} already exists",
                    route.id()
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(route.clone());
            }
        }

        info!(route_id = %route.id(), "Route created");
        self.notify(RouteChange::Upserted(route.id().to_string()));
        Ok(route)
    }

    /// Replace a route. `definition.version` must equal the stored version;
    /// the stored version is then incremented.
    pub fn update(&self, route_id: &str, mut definition: RouteDefinition) -> Result<Arc<Route>> {
        if definition.route_id != route_id {
            return Err(GatewayError::Validation(format!(
                "Route id in body ({}) does not match path ({})",
                definition.route_id, route_id
            )));
        }

        let mut current = self
            .routes
            .get_mut(route_id)
            .ok_or_else(|| GatewayError::RouteNotFound(route_id.to_string()))?;

        if current.version() != definition.version {
            return Err(GatewayError::Conflict(format!(
                "Route {} is at version {}, update was based on version {}",
                route_id,
                current.version(),
                definition.version
            )));
        }

        definition.version = current.version() + 1;
        definition.created_at = current.created_at();
        definition.created_by = current.definition().created_by.clone();
        definition.updated_at = Utc::now();

        let route = Arc::new(Route::new(definition)?);
        *current = route.clone();
        drop(current);

        info!(route_id, version = route.version(), "Route updated");
        self.notify(RouteChange::Upserted(route_id.to_string()));
        Ok(route)
    }

    pub fn delete(&self, route_id: &str) -> Result<()> {
        self.routes
            .remove(route_id)
            .ok_or_else(|| GatewayError::RouteNotFound(route_id.to_string()))?;

        info!(route_id, "Route deleted");
        self.notify(RouteChange::Deleted(route_id.to_string()));
        Ok(())
    }

    pub fn get(&self, route_id: &str) -> Option<Arc<Route>> {
        self.routes.get(route_id).map(|r| r.value().clone())
    }

    /// Every stored route regardless of status, ordered by id
    pub fn list_all(&self) -> Vec<Arc<Route>> {
        let mut all: Vec<Arc<Route>> = self.routes.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Atomically swap the full route set. Nothing changes unless every
    /// definition validates and ids are unique.
    pub fn replace_all(&self, definitions: Vec<RouteDefinition>) -> Result<()> {
        let mut compiled = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if compiled.iter().any(|r: &Arc<Route>| r.id() == definition.route_id) {
                return Err(GatewayError::Validation(format!(
                    "Duplicate route id: {}",
                    definition.route_id
                )));
            }
            compiled.push(Arc::new(Route::new(definition)?));
        }

        let count = compiled.len();
        self.routes
            .retain(|id, _| compiled.iter().any(|r| r.id() == id.as_str()));
        for route in compiled {
            self.routes.insert(route.id().to_string(), route);
        }

        info!(count, "Route set replaced");
        self.notify(RouteChange::Reloaded);
        Ok(())
    }

    fn notify(&self, change: RouteChange) {
        // No subscribers is not an error
        if self.changes.send(change.clone()).is_err() {
            debug!(?change, "Route change without subscribers");
        }
    }
}

impl Default for InMemoryRouteRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteRepository for InMemoryRouteRepository {
    async fn list_active_routes(&self) -> Result<Vec<Arc<Route>>> {
        Ok(self
            .routes
            .iter()
            .filter(|r| r.is_live())
            .map(|r| r.value().clone())
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<RouteChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::tests::target;
    use crate::route::RouteStatus;

    fn orders() -> RouteDefinition {
        RouteDefinition::new("orders", "/api/orders/**", vec![target("orders", 1, true)])
    }

    #[tokio::test]
    async fn test_create_and_list_active() {
        let repository = InMemoryRouteRepository::new();
        repository.create(orders()).unwrap();

        let mut draft = RouteDefinition::new("draft", "/api/draft", vec![]);
        draft.status = RouteStatus::Draft;
        repository.create(draft).unwrap();

        let active = repository.list_active_routes().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), "orders");
        assert_eq!(repository.list_all().len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let repository = InMemoryRouteRepository::new();
        repository.create(orders()).unwrap();
        assert!(matches!(
            repository.create(orders()),
            Err(GatewayError::Conflict(_))
        ));
    }

    #[test]
    fn test_update_checks_version() {
        let repository = InMemoryRouteRepository::new();
        let created = repository.create(orders()).unwrap();
        assert_eq!(created.version(), 1);

        let mut change = orders();
        change.priority = 5;
        let updated = repository.update("orders", change.clone()).unwrap();
        assert_eq!(updated.version(), 2);
        assert_eq!(updated.priority(), 5);
        assert_eq!(updated.created_at(), created.created_at());

        // Stale version
        assert!(matches!(
            repository.update("orders", change),
            Err(GatewayError::Conflict(_))
        ));

        assert!(matches!(
            repository.update("missing", RouteDefinition::new("missing", "/x", vec![target("a", 1, true)])),
            Err(GatewayError::RouteNotFound(_))
        ));
    }

    #[test]
    fn test_replace_all_is_all_or_nothing() {
        let repository = InMemoryRouteRepository::with_routes(vec![orders()]).unwrap();

        let invalid = RouteDefinition::new("bad id", "/x", vec![target("a", 1, true)]);
        let other = RouteDefinition::new("users", "/api/users", vec![target("users", 1, true)]);
        assert!(repository.replace_all(vec![other.clone(), invalid]).is_err());
        assert!(repository.get("orders").is_some());
        assert!(repository.get("users").is_none());

        repository.replace_all(vec![other]).unwrap();
        assert!(repository.get("orders").is_none());
        assert!(repository.get("users").is_some());
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let repository = InMemoryRouteRepository::new();
        let mut changes = repository.subscribe();

        repository.create(orders()).unwrap();
        repository.delete("orders").unwrap();

        assert_eq!(
            changes.recv().await.unwrap(),
            RouteChange::Upserted("orders".to_string())
        );
        assert_eq!(
            changes.recv().await.unwrap(),
            RouteChange::Deleted("orders".to_string())
        );
        assert!(repository.delete("orders").is_err());
    }
}
