//! Route data model
//!
//! A [`RouteDefinition`] is the serializable form exchanged with the
//! administrative API and the configuration file. [`Route::new`] validates a
//! definition once and compiles it (path pattern, condition regexes, canary
//! IP ranges, transforms) into an immutable [`Route`] shared by reference
//! across requests.

pub mod pattern;

use crate::error::{GatewayError, Result};
use crate::transform::{TransformConfig, TransformService};
use chrono::{DateTime, Utc};
use http::Method;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;

pub use pattern::PathPattern;

/// Route lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteStatus {
    #[default]
    Active,
    Inactive,
    Archived,
    Draft,
}

/// Comparison operator for a header/query/body condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    Regex,
    Exists,
    NotExists,
}

impl ConditionOperator {
    fn needs_value(self) -> bool {
        !matches!(self, ConditionOperator::Exists | ConditionOperator::NotExists)
    }
}

/// Serializable condition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionDefinition {
    /// Header name, query parameter name, or dot-notation body path
    pub field: String,
    #[serde(default)]
    pub expected_value: Option<String>,
    #[serde(default)]
    pub operator: ConditionOperator,
}

/// Compiled condition
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub expected_value: Option<String>,
    pub operator: ConditionOperator,
    regex: Option<Regex>,
}

impl Condition {
    fn compile(def: &ConditionDefinition) -> Result<Self> {
        if def.field.is_empty() {
            return Err(GatewayError::Validation(
                "Condition field cannot be empty".to_string(),
            ));
        }
        if def.operator.needs_value() && def.expected_value.is_none() {
            return Err(GatewayError::Validation(format!(
                "Condition on '{}' with operator {:?} requires an expected value",
                def.field, def.operator
            )));
        }

        let regex = match (def.operator, &def.expected_value) {
            (ConditionOperator::Regex, Some(expr)) => Some(Regex::new(expr).map_err(|e| {
                GatewayError::Validation(format!(
                    "Invalid condition regex '{}' on '{}': {}",
                    expr, def.field, e
                ))
            })?),
            _ => None,
        };

        Ok(Self {
            field: def.field.clone(),
            expected_value: def.expected_value.clone(),
            operator: def.operator,
            regex,
        })
    }

    /// Evaluate the operator against an observed value (`None` when absent)
    pub fn evaluate(&self, actual: Option<&str>) -> bool {
        let expected = self.expected_value.as_deref().unwrap_or_default();
        match self.operator {
            ConditionOperator::Exists => actual.is_some(),
            ConditionOperator::NotExists => actual.is_none(),
            ConditionOperator::Equals => actual == Some(expected),
            ConditionOperator::NotEquals => actual != Some(expected),
            ConditionOperator::Contains => actual.is_some_and(|v| v.contains(expected)),
            ConditionOperator::Regex => match (actual, &self.regex) {
                (Some(v), Some(regex)) => regex.is_match(v),
                _ => false,
            },
        }
    }
}

/// A backend a route may dispatch to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetService {
    pub service_id: String,
    pub target_uri: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Regions (countries) or segments this target serves
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub extra_query_params: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

impl TargetService {
    pub fn serves(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r.eq_ignore_ascii_case(region))
    }
}

/// Canary rollout parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanaryConfig {
    /// Share of traffic (0-100) sent to the canary target
    #[serde(default)]
    pub percentage: f64,
    /// Header whose presence with a truthy value forces the canary target
    #[serde(default = "default_canary_header")]
    pub forced_header: String,
    #[serde(default)]
    pub allowed_user_ids: Vec<String>,
    /// Client IPs or CIDR ranges always routed to the canary
    #[serde(default)]
    pub allowed_ip_ranges: Vec<String>,
    /// Linear ramp from 0 to `percentage` starting at `ramp_up_start`
    #[serde(default)]
    pub ramp_up_duration_minutes: Option<u64>,
    #[serde(default)]
    pub ramp_up_start: Option<DateTime<Utc>>,
    #[serde(skip)]
    networks: Vec<IpNetwork>,
}

fn default_canary_header() -> String {
    "X-Canary".to_string()
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl CanaryConfig {
    pub fn new(percentage: f64) -> Self {
        Self {
            percentage,
            forced_header: default_canary_header(),
            allowed_user_ids: vec![],
            allowed_ip_ranges: vec![],
            ramp_up_duration_minutes: None,
            ramp_up_start: None,
            networks: vec![],
        }
    }

    fn compile(&mut self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.percentage) {
            return Err(GatewayError::Validation(format!(
                "Canary percentage must be within 0-100, got {}",
                self.percentage
            )));
        }
        if self.ramp_up_duration_minutes == Some(0) {
            return Err(GatewayError::Validation(
                "Canary ramp-up duration must be > 0".to_string(),
            ));
        }
        self.networks = self
            .allowed_ip_ranges
            .iter()
            .map(|range| {
                IpNetwork::from_str(range).map_err(|e| {
                    GatewayError::Validation(format!("Invalid canary IP range '{}': {}", range, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    pub fn networks(&self) -> &[IpNetwork] {
        &self.networks
    }

    /// Effective canary percentage at `now`, honoring the ramp if configured
    pub fn effective_percentage(&self, now: DateTime<Utc>) -> f64 {
        match (self.ramp_up_duration_minutes, self.ramp_up_start) {
            (Some(minutes), Some(start)) => {
                let elapsed_ms = (now - start).num_milliseconds();
                if elapsed_ms <= 0 {
                    return 0.0;
                }
                let total_ms = (minutes * 60_000) as f64;
                let progress = (elapsed_ms as f64 / total_ms).min(1.0);
                self.percentage * progress
            }
            _ => self.percentage,
        }
    }
}

/// Blue/green steering parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlueGreenConfig {
    #[serde(default = "default_slot_header")]
    pub header: String,
    #[serde(default = "default_green_value")]
    pub green_value: String,
}

fn default_slot_header() -> String {
    "X-Deployment-Slot".to_string()
}

fn default_green_value() -> String {
    "green".to_string()
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            header: default_slot_header(),
            green_value: default_green_value(),
        }
    }
}

/// Geography parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GeoConfig {
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default)]
    pub blocked_countries: Vec<String>,
}

impl GeoConfig {
    pub fn is_blocked(&self, country: &str) -> bool {
        if self
            .blocked_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(country))
        {
            return true;
        }
        !self.allowed_countries.is_empty()
            && !self
                .allowed_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(country))
    }
}

/// Where to read the user's segment from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentSource {
    #[default]
    Header,
    Cookie,
    Query,
}

/// Segment routing parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentConfig {
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub source: SegmentSource,
    /// Header, cookie or query parameter name holding the segment
    #[serde(default = "default_segment_key")]
    pub key: String,
}

fn default_segment_key() -> String {
    "X-User-Segment".to_string()
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            segments: vec![],
            source: SegmentSource::default(),
            key: default_segment_key(),
        }
    }
}

/// Routing strategy together with its parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingStrategy {
    #[default]
    Simple,
    Weighted,
    Canary(CanaryConfig),
    BlueGreen(BlueGreenConfig),
    Geographic(GeoConfig),
    SegmentBased(SegmentConfig),
    Failover,
    Mirror,
}

impl RoutingStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RoutingStrategy::Simple => "SIMPLE",
            RoutingStrategy::Weighted => "WEIGHTED",
            RoutingStrategy::Canary(_) => "CANARY",
            RoutingStrategy::BlueGreen(_) => "BLUE_GREEN",
            RoutingStrategy::Geographic(_) => "GEOGRAPHIC",
            RoutingStrategy::SegmentBased(_) => "SEGMENT_BASED",
            RoutingStrategy::Failover => "FAILOVER",
            RoutingStrategy::Mirror => "MIRROR",
        }
    }
}

/// Serializable route configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteDefinition {
    pub route_id: String,
    #[serde(default = "default_version")]
    pub version: u64,
    pub path_pattern: String,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub header_conditions: Vec<ConditionDefinition>,
    #[serde(default)]
    pub query_conditions: Vec<ConditionDefinition>,
    #[serde(default)]
    pub body_conditions: Vec<ConditionDefinition>,
    #[serde(default)]
    pub targets: Vec<TargetService>,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub blocked_roles: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub status: RouteStatus,
    /// Endpoint key used for rate-limit policy resolution (defaults to the path pattern)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

fn default_version() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

impl RouteDefinition {
    /// Minimal active definition with the given targets
    pub fn new(route_id: &str, path_pattern: &str, targets: Vec<TargetService>) -> Self {
        let now = Utc::now();
        Self {
            route_id: route_id.to_string(),
            version: default_version(),
            path_pattern: path_pattern.to_string(),
            http_method: None,
            header_conditions: vec![],
            query_conditions: vec![],
            body_conditions: vec![],
            targets,
            strategy: RoutingStrategy::default(),
            allowed_roles: vec![],
            blocked_roles: vec![],
            priority: 0,
            enabled: true,
            status: RouteStatus::Active,
            endpoint: None,
            transform: None,
            created_at: now,
            created_by: None,
            updated_at: now,
            updated_by: None,
        }
    }
}

fn route_id_regex() -> &'static Regex {
    static ROUTE_ID: OnceLock<Regex> = OnceLock::new();
    ROUTE_ID.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static route id regex"))
}

/// Validated, compiled route
#[derive(Debug)]
pub struct Route {
    definition: RouteDefinition,
    pattern: PathPattern,
    method: Option<Method>,
    header_conditions: Vec<Condition>,
    query_conditions: Vec<Condition>,
    body_conditions: Vec<Condition>,
    transform: Option<TransformService>,
}

impl Route {
    /// Validate and compile a route definition
    pub fn new(mut definition: RouteDefinition) -> Result<Self> {
        if !route_id_regex().is_match(&definition.route_id) {
            return Err(GatewayError::Validation(format!(
                "Route id must match [a-zA-Z0-9_-]+: '{}'",
                definition.route_id
            )));
        }

        let pattern = PathPattern::parse(&definition.path_pattern)?;

        let method = definition
            .http_method
            .as_deref()
            .map(|m| {
                let upper = m.to_uppercase();
                if !["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
                    .contains(&upper.as_str())
                {
                    return Err(GatewayError::Validation(format!(
                        "Invalid HTTP method '{}' for route: {}",
                        m, definition.route_id
                    )));
                }
                Method::from_bytes(upper.as_bytes())
                    .map_err(|_| GatewayError::Validation(format!("Invalid HTTP method: {}", m)))
            })
            .transpose()?;

        if definition.status == RouteStatus::Active && definition.targets.is_empty() {
            return Err(GatewayError::Validation(format!(
                "Route {} must have at least one target before it can be ACTIVE",
                definition.route_id
            )));
        }

        for target in &definition.targets {
            if target.service_id.is_empty() {
                return Err(GatewayError::Validation(format!(
                    "Target service id cannot be empty for route: {}",
                    definition.route_id
                )));
            }
            if !target.target_uri.starts_with("http://") && !target.target_uri.starts_with("https://")
            {
                return Err(GatewayError::Validation(format!(
                    "Target URI must start with http:// or https:// for route: {}",
                    definition.route_id
                )));
            }
        }

        if let RoutingStrategy::Canary(canary) = &mut definition.strategy {
            canary.compile()?;
        }

        let compile_all = |defs: &[ConditionDefinition]| {
            defs.iter().map(Condition::compile).collect::<Result<Vec<_>>>()
        };
        let header_conditions = compile_all(&definition.header_conditions)?;
        let query_conditions = compile_all(&definition.query_conditions)?;
        let body_conditions = compile_all(&definition.body_conditions)?;

        let transform = definition
            .transform
            .clone()
            .map(TransformService::new)
            .transpose()?;

        Ok(Self {
            definition,
            pattern,
            method,
            header_conditions,
            query_conditions,
            body_conditions,
            transform,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.route_id
    }

    pub fn version(&self) -> u64 {
        self.definition.version
    }

    pub fn definition(&self) -> &RouteDefinition {
        &self.definition
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn header_conditions(&self) -> &[Condition] {
        &self.header_conditions
    }

    pub fn query_conditions(&self) -> &[Condition] {
        &self.query_conditions
    }

    pub fn body_conditions(&self) -> &[Condition] {
        &self.body_conditions
    }

    pub fn targets(&self) -> &[TargetService] {
        &self.definition.targets
    }

    pub fn strategy(&self) -> &RoutingStrategy {
        &self.definition.strategy
    }

    pub fn allowed_roles(&self) -> &[String] {
        &self.definition.allowed_roles
    }

    pub fn blocked_roles(&self) -> &[String] {
        &self.definition.blocked_roles
    }

    pub fn priority(&self) -> i32 {
        self.definition.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.definition.created_at
    }

    /// Enabled and ACTIVE
    pub fn is_live(&self) -> bool {
        self.definition.enabled && self.definition.status == RouteStatus::Active
    }

    pub fn endpoint(&self) -> &str {
        self.definition
            .endpoint
            .as_deref()
            .unwrap_or(&self.definition.path_pattern)
    }

    pub fn transform(&self) -> Option<&TransformService> {
        self.transform.as_ref()
    }

    /// First target flagged primary, else the first target
    pub fn primary_target(&self) -> Option<&TargetService> {
        let targets = self.targets();
        targets
            .iter()
            .find(|t| t.is_primary)
            .or_else(|| targets.first())
    }

    /// Whether this route could serve `method` + `path`, ignoring conditions
    pub fn matches_method_and_path(&self, method: &Method, path: &str) -> bool {
        if let Some(expected) = &self.method {
            if expected != method {
                return false;
            }
        }
        self.pattern.is_match(path)
    }
}

/// Route ordering: higher priority first, then earliest creation, then id
pub fn route_order(a: &Route, b: &Route) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.created_at().cmp(&b.created_at()))
        .then_with(|| a.id().cmp(b.id()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn target(id: &str, weight: u32, primary: bool) -> TargetService {
        TargetService {
            service_id: id.to_string(),
            target_uri: format!("http://{}.internal:8080", id),
            weight,
            regions: vec![],
            is_primary: primary,
            extra_headers: HashMap::new(),
            extra_query_params: HashMap::new(),
        }
    }

    #[test]
    fn test_route_id_validation() {
        let bad = RouteDefinition::new("orders api", "/api/orders", vec![target("a", 1, true)]);
        assert!(matches!(Route::new(bad), Err(GatewayError::Validation(_))));

        let good = RouteDefinition::new("orders-api_v1", "/api/orders", vec![target("a", 1, true)]);
        assert!(Route::new(good).is_ok());
    }

    #[test]
    fn test_active_route_requires_target() {
        let def = RouteDefinition::new("orders", "/api/orders", vec![]);
        assert!(Route::new(def.clone()).is_err());

        let mut draft = def;
        draft.status = RouteStatus::Draft;
        let route = Route::new(draft).unwrap();
        assert!(!route.is_live());
    }

    #[test]
    fn test_invalid_method_and_target_uri() {
        let mut def = RouteDefinition::new("orders", "/api/orders", vec![target("a", 1, true)]);
        def.http_method = Some("FETCH".to_string());
        assert!(Route::new(def).is_err());

        let mut bad_target = target("a", 1, true);
        bad_target.target_uri = "ftp://orders".to_string();
        let def = RouteDefinition::new("orders", "/api/orders", vec![bad_target]);
        assert!(Route::new(def).is_err());
    }

    #[test]
    fn test_condition_requires_value() {
        let mut def = RouteDefinition::new("orders", "/api/orders", vec![target("a", 1, true)]);
        def.header_conditions.push(ConditionDefinition {
            field: "X-Tenant".to_string(),
            expected_value: None,
            operator: ConditionOperator::Equals,
        });
        assert!(Route::new(def.clone()).is_err());

        def.header_conditions[0].operator = ConditionOperator::Exists;
        assert!(Route::new(def).is_ok());
    }

    #[test]
    fn test_condition_operators() {
        let make = |operator, value: Option<&str>| {
            Condition::compile(&ConditionDefinition {
                field: "f".to_string(),
                expected_value: value.map(str::to_string),
                operator,
            })
            .unwrap()
        };

        assert!(make(ConditionOperator::Equals, Some("a")).evaluate(Some("a")));
        assert!(!make(ConditionOperator::Equals, Some("a")).evaluate(None));
        assert!(make(ConditionOperator::NotEquals, Some("a")).evaluate(None));
        assert!(make(ConditionOperator::Contains, Some("mob")).evaluate(Some("mobile-ios")));
        assert!(make(ConditionOperator::Regex, Some(r"^v\d+$")).evaluate(Some("v2")));
        assert!(!make(ConditionOperator::Regex, Some(r"^v\d+$")).evaluate(Some("beta")));
        assert!(make(ConditionOperator::Exists, None).evaluate(Some("")));
        assert!(make(ConditionOperator::NotExists, None).evaluate(None));
    }

    #[test]
    fn test_canary_validation_and_ramp() {
        let mut canary = CanaryConfig {
            percentage: 40.0,
            allowed_ip_ranges: vec!["10.0.0.0/8".to_string()],
            ramp_up_duration_minutes: Some(10),
            ramp_up_start: Some(Utc::now() - chrono::Duration::minutes(5)),
            ..Default::default()
        };
        canary.compile().unwrap();
        assert_eq!(canary.networks().len(), 1);

        let half = canary.effective_percentage(Utc::now());
        assert!((half - 20.0).abs() < 0.5, "expected ~20, got {}", half);

        let later = Utc::now() + chrono::Duration::minutes(30);
        assert_eq!(canary.effective_percentage(later), 40.0);

        let mut bad = CanaryConfig {
            percentage: 120.0,
            ..Default::default()
        };
        assert!(bad.compile().is_err());

        let mut bad_ip = CanaryConfig {
            allowed_ip_ranges: vec!["not-an-ip".to_string()],
            ..Default::default()
        };
        assert!(bad_ip.compile().is_err());
    }

    #[test]
    fn test_route_ordering() {
        let now = Utc::now();
        let mut high = RouteDefinition::new("high", "/a", vec![target("a", 1, true)]);
        high.priority = 10;
        high.created_at = now;
        let mut old = RouteDefinition::new("old", "/a", vec![target("a", 1, true)]);
        old.created_at = now - chrono::Duration::hours(1);
        let mut new = RouteDefinition::new("new", "/a", vec![target("a", 1, true)]);
        new.created_at = now;

        let mut routes: Vec<Route> = vec![new, old, high]
            .into_iter()
            .map(|d| Route::new(d).unwrap())
            .collect();
        routes.sort_by(route_order);

        let ids: Vec<&str> = routes.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["high", "old", "new"]);
    }

    #[test]
    fn test_strategy_yaml() {
        let yaml = r#"
route_id: checkout
path_pattern: /api/checkout/**
targets:
  - service_id: stable
    target_uri: http://stable:8080
    is_primary: true
  - service_id: canary
    target_uri: http://canary:8080
strategy:
  type: CANARY
  percentage: 5
  allowed_user_ids: ["qa-1"]
"#;
        let def: RouteDefinition = serde_yaml::from_str(yaml).unwrap();
        let route = Route::new(def).unwrap();
        assert_eq!(route.strategy().name(), "CANARY");
        assert_eq!(route.endpoint(), "/api/checkout/**");
        assert_eq!(route.primary_target().unwrap().service_id, "stable");
        assert_eq!(route.version(), 1);
    }

    #[test]
    fn test_geo_blocking_rules() {
        let geo = GeoConfig {
            allowed_countries: vec![],
            blocked_countries: vec!["KP".to_string()],
        };
        assert!(geo.is_blocked("kp"));
        assert!(!geo.is_blocked("DE"));

        let allow_only = GeoConfig {
            allowed_countries: vec!["DE".to_string(), "FR".to_string()],
            blocked_countries: vec![],
        };
        assert!(!allow_only.is_blocked("FR"));
        assert!(allow_only.is_blocked("US"));
    }
}
