//! Target selection: applies a route's routing strategy to pick the backend
//! for one request.

pub mod health;
pub mod strategies;

pub use health::{HealthRegistry, HealthSource};
pub use strategies::{strategy_for, Selection, SelectionInput, Strategy};

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::route::Route;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::sync::Arc;
use tracing::debug;

/// Picks a [`TargetService`](crate::route::TargetService) for a matched route
#[derive(Clone)]
pub struct TargetSelector {
    health: Arc<dyn HealthSource>,
}

impl TargetSelector {
    pub fn new(health: Arc<dyn HealthSource>) -> Self {
        Self { health }
    }

    /// Select using the thread-local RNG and the wall clock
    pub fn select(&self, route: &Route, ctx: &RequestContext) -> Result<Selection> {
        self.select_with(route, ctx, &mut rand::thread_rng(), Utc::now())
    }

    /// Select with an explicit random source and instant
    pub fn select_with(
        &self,
        route: &Route,
        ctx: &RequestContext,
        rng: &mut dyn RngCore,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        if route.targets().is_empty() {
            return Err(GatewayError::NoTargetsConfigured(route.id().to_string()));
        }

        let input = SelectionInput {
            route,
            ctx,
            health: self.health.as_ref(),
            now,
        };
        let selection = strategy_for(route.strategy()).select(&input, rng)?;

        debug!(
            route_id = %route.id(),
            strategy = route.strategy().name(),
            target = %selection.target.service_id,
            mirrors = selection.mirrors.len(),
            "Target selected"
        );
        Ok(selection)
    }
}

impl Default for TargetSelector {
    fn default() -> Self {
        Self::new(Arc::new(HealthRegistry::default()))
    }
}
