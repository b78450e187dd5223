use super::health::HealthSource;
use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::route::{
    BlueGreenConfig, CanaryConfig, GeoConfig, Route, RoutingStrategy, SegmentConfig,
    SegmentSource, TargetService,
};
use chrono::{DateTime, Utc};
use rand::{Rng, RngCore};

/// Everything a strategy may look at when picking a target
pub struct SelectionInput<'a> {
    pub route: &'a Route,
    pub ctx: &'a RequestContext,
    pub health: &'a dyn HealthSource,
    pub now: DateTime<Utc>,
}

impl<'a> SelectionInput<'a> {
    fn targets(&self) -> &'a [TargetService] {
        self.route.targets()
    }

    fn primary(&self) -> Result<&'a TargetService> {
        self.route
            .primary_target()
            .ok_or_else(|| GatewayError::NoTargetsConfigured(self.route.id().to_string()))
    }

    /// First target that is not the primary
    fn secondary(&self) -> Option<&'a TargetService> {
        let primary = self.route.primary_target()?;
        self.targets()
            .iter()
            .find(|t| !std::ptr::eq(*t, primary))
    }
}

/// Chosen target plus any targets that should receive a mirrored copy
#[derive(Debug, Clone)]
pub struct Selection {
    pub target: TargetService,
    pub mirrors: Vec<TargetService>,
}

impl Selection {
    fn single(target: &TargetService) -> Self {
        Self {
            target: target.clone(),
            mirrors: vec![],
        }
    }
}

/// A routing strategy: one implementation per [`RoutingStrategy`] variant
pub trait Strategy: Send + Sync {
    fn select(&self, input: &SelectionInput<'_>, rng: &mut dyn RngCore) -> Result<Selection>;
}

pub struct SimpleStrategy;
pub struct WeightedStrategy;
pub struct FailoverStrategy;
pub struct MirrorStrategy;

/// Resolve the implementation for a configured strategy
pub fn strategy_for(strategy: &RoutingStrategy) -> &dyn Strategy {
    match strategy {
        RoutingStrategy::Simple => &SimpleStrategy,
        RoutingStrategy::Weighted => &WeightedStrategy,
        RoutingStrategy::Canary(config) => config,
        RoutingStrategy::BlueGreen(config) => config,
        RoutingStrategy::Geographic(config) => config,
        RoutingStrategy::SegmentBased(config) => config,
        RoutingStrategy::Failover => &FailoverStrategy,
        RoutingStrategy::Mirror => &MirrorStrategy,
    }
}

impl Strategy for SimpleStrategy {
    fn select(&self, input: &SelectionInput<'_>, _rng: &mut dyn RngCore) -> Result<Selection> {
        input
            .targets()
            .first()
            .map(Selection::single)
            .ok_or_else(|| GatewayError::NoTargetsConfigured(input.route.id().to_string()))
    }
}

impl Strategy for WeightedStrategy {
    fn select(&self, input: &SelectionInput<'_>, rng: &mut dyn RngCore) -> Result<Selection> {
        let targets = input.targets();
        let total_weight: u64 = targets.iter().map(|t| t.weight as u64).sum();

        if total_weight == 0 {
            return Err(GatewayError::NoTargetsConfigured(format!(
                "{} (all target weights are zero)",
                input.route.id()
            )));
        }

        let position = rng.gen_range(0..total_weight);
        let mut cumulative_weight = 0u64;
        for target in targets {
            cumulative_weight += target.weight as u64;
            if position < cumulative_weight {
                return Ok(Selection::single(target));
            }
        }

        // position < total_weight always lands above
        Err(GatewayError::Internal(
            "Weighted selection fell through".to_string(),
        ))
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

impl CanaryConfig {
    fn is_allowlisted(&self, ctx: &RequestContext) -> bool {
        let user_listed = ctx
            .identity()
            .user_id
            .as_ref()
            .is_some_and(|id| self.allowed_user_ids.contains(id));
        user_listed || self.networks().iter().any(|net| net.contains(ctx.client_ip()))
    }
}

impl Strategy for CanaryConfig {
    fn select(&self, input: &SelectionInput<'_>, rng: &mut dyn RngCore) -> Result<Selection> {
        let primary = input.primary()?;
        let Some(canary) = input.secondary() else {
            return Ok(Selection::single(primary));
        };

        if !self.forced_header.is_empty()
            && input.ctx.header(&self.forced_header).is_some_and(is_truthy)
        {
            return Ok(Selection::single(canary));
        }

        if self.is_allowlisted(input.ctx) {
            return Ok(Selection::single(canary));
        }

        let percentage = self.effective_percentage(input.now);
        if percentage > 0.0 && rng.gen::<f64>() * 100.0 < percentage {
            return Ok(Selection::single(canary));
        }

        Ok(Selection::single(primary))
    }
}

impl Strategy for BlueGreenConfig {
    fn select(&self, input: &SelectionInput<'_>, _rng: &mut dyn RngCore) -> Result<Selection> {
        let blue = input.primary()?;
        let wants_green = input
            .ctx
            .header(&self.header)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case(&self.green_value));

        match (wants_green, input.secondary()) {
            (true, Some(green)) => Ok(Selection::single(green)),
            _ => Ok(Selection::single(blue)),
        }
    }
}

impl Strategy for GeoConfig {
    fn select(&self, input: &SelectionInput<'_>, _rng: &mut dyn RngCore) -> Result<Selection> {
        let primary = input.primary()?;
        let Some(country) = input.ctx.identity().country.as_deref() else {
            return Ok(Selection::single(primary));
        };

        if self.is_blocked(country) {
            return Err(GatewayError::GeoBlocked {
                route_id: input.route.id().to_string(),
                country: country.to_string(),
            });
        }

        let target = input
            .targets()
            .iter()
            .find(|t| t.serves(country))
            .unwrap_or(primary);
        Ok(Selection::single(target))
    }
}

impl SegmentConfig {
    fn segment_of<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        let from_source = match self.source {
            SegmentSource::Header => ctx.header(&self.key),
            SegmentSource::Cookie => ctx.cookie(&self.key),
            SegmentSource::Query => ctx.query_param(&self.key),
        };
        from_source.or(ctx.identity().segment.as_deref())
    }
}

impl Strategy for SegmentConfig {
    fn select(&self, input: &SelectionInput<'_>, _rng: &mut dyn RngCore) -> Result<Selection> {
        let primary = input.primary()?;
        let segment = match self.segment_of(input.ctx) {
            Some(segment) => segment,
            None => return Ok(Selection::single(primary)),
        };

        if !self.segments.is_empty() && !self.segments.iter().any(|s| s == segment) {
            return Ok(Selection::single(primary));
        }

        let target = input
            .targets()
            .iter()
            .find(|t| t.serves(segment))
            .unwrap_or(primary);
        Ok(Selection::single(target))
    }
}

impl Strategy for FailoverStrategy {
    fn select(&self, input: &SelectionInput<'_>, _rng: &mut dyn RngCore) -> Result<Selection> {
        let targets = input.targets();
        let healthy = |t: &&TargetService| input.health.admit(&t.service_id);

        let chosen = targets
            .iter()
            .filter(|t| t.is_primary)
            .find(healthy)
            .or_else(|| targets.iter().filter(|t| !t.is_primary).find(healthy));

        match chosen {
            Some(target) => Ok(Selection::single(target)),
            None => Ok(Selection::single(input.primary()?)),
        }
    }
}

impl Strategy for MirrorStrategy {
    fn select(&self, input: &SelectionInput<'_>, _rng: &mut dyn RngCore) -> Result<Selection> {
        let primary = input.primary()?;
        let mirrors = input
            .targets()
            .iter()
            .filter(|t| !std::ptr::eq(*t, primary))
            .cloned()
            .collect();

        Ok(Selection {
            target: primary.clone(),
            mirrors,
        })
    }
}
