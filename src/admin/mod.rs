//! Administrative API: route and policy management, cache control,
//! health overrides and metrics.

use crate::cache::RouteCache;
use crate::error::{GatewayError, Result};
use crate::metrics::{metrics_handler, MetricsService};
use crate::rate_limit::policy::InMemoryPolicyStore;
use crate::rate_limit::types::RateLimitPolicy;
use crate::repository::InMemoryRouteRepository;
use crate::route::RouteDefinition;
use crate::selector::HealthRegistry;
use axum::{
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AdminState {
    pub routes: Arc<InMemoryRouteRepository>,
    pub policies: Arc<InMemoryPolicyStore>,
    pub cache: Arc<RouteCache>,
    pub health: Arc<HealthRegistry>,
    pub metrics: MetricsService,
}

impl FromRef<AdminState> for MetricsService {
    fn from_ref(state: &AdminState) -> Self {
        state.metrics.clone()
    }
}

/// Body of `PUT /admin/health/:service_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthUpdate {
    pub healthy: bool,
}

#[derive(Debug, Serialize)]
struct TargetHealth {
    service_id: String,
    healthy: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/routes", get(list_routes).post(create_route))
        .route(
            "/admin/routes/:route_id",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/admin/policies", get(list_policies).post(create_policy))
        .route(
            "/admin/policies/:policy_id",
            get(get_policy).put(update_policy).delete(delete_policy),
        )
        .route("/admin/cache/invalidate", post(invalidate_cache))
        .route("/admin/health", get(list_health))
        .route("/admin/health/:service_id", put(set_health))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn list_routes(State(state): State<AdminState>) -> impl IntoResponse {
    let routes: Vec<RouteDefinition> = state
        .routes
        .list_all()
        .iter()
        .map(|r| r.definition().clone())
        .collect();
    Json(routes)
}

async fn get_route(
    State(state): State<AdminState>,
    Path(route_id): Path<String>,
) -> Result<impl IntoResponse> {
    let route = state
        .routes
        .get(&route_id)
        .ok_or(GatewayError::RouteNotFound(route_id))?;
    Ok(Json(route.definition().clone()))
}

async fn create_route(
    State(state): State<AdminState>,
    Json(definition): Json<RouteDefinition>,
) -> Result<impl IntoResponse> {
    let route = state.routes.create(definition)?;
    state.cache.invalidate();
    Ok((StatusCode::CREATED, Json(route.definition().clone())))
}

/// `version` in the body must equal the stored version
async fn update_route(
    State(state): State<AdminState>,
    Path(route_id): Path<String>,
    Json(definition): Json<RouteDefinition>,
) -> Result<impl IntoResponse> {
    let route = state.routes.update(&route_id, definition)?;
    state.cache.invalidate();
    Ok(Json(route.definition().clone()))
}

async fn delete_route(
    State(state): State<AdminState>,
    Path(route_id): Path<String>,
) -> Result<impl IntoResponse> {
    state.routes.delete(&route_id)?;
    state.cache.invalidate();
    Ok(StatusCode::NO_CONTENT)
}

async fn list_policies(State(state): State<AdminState>) -> impl IntoResponse {
    let policies: Vec<RateLimitPolicy> = state
        .policies
        .list()
        .iter()
        .map(|p| p.as_ref().clone())
        .collect();
    Json(policies)
}

async fn get_policy(
    State(state): State<AdminState>,
    Path(policy_id): Path<String>,
) -> Result<impl IntoResponse> {
    let policy = state
        .policies
        .get(&policy_id)
        .ok_or(GatewayError::PolicyNotFound(policy_id))?;
    Ok(Json(policy.as_ref().clone()))
}

async fn create_policy(
    State(state): State<AdminState>,
    Json(policy): Json<RateLimitPolicy>,
) -> Result<impl IntoResponse> {
    let policy = state.policies.create(policy)?;
    Ok((StatusCode::CREATED, Json(policy.as_ref().clone())))
}

async fn update_policy(
    State(state): State<AdminState>,
    Path(policy_id): Path<String>,
    Json(policy): Json<RateLimitPolicy>,
) -> Result<impl IntoResponse> {
    let policy = state.policies.update(&policy_id, policy)?;
    Ok(Json(policy.as_ref().clone()))
}

async fn delete_policy(
    State(state): State<AdminState>,
    Path(policy_id): Path<String>,
) -> Result<impl IntoResponse> {
    state.policies.delete(&policy_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invalidate_cache(State(state): State<AdminState>) -> impl IntoResponse {
    state.cache.invalidate();
    info!("Route cache invalidated through admin API");
    Json(json!({ "invalidated": true }))
}

async fn list_health(State(state): State<AdminState>) -> impl IntoResponse {
    let targets: Vec<TargetHealth> = state
        .health
        .snapshot()
        .into_iter()
        .map(|(service_id, healthy)| TargetHealth {
            service_id,
            healthy,
        })
        .collect();
    Json(targets)
}

async fn set_health(
    State(state): State<AdminState>,
    Path(service_id): Path<String>,
    Json(update): Json<HealthUpdate>,
) -> impl IntoResponse {
    state.health.set_health(&service_id, update.healthy);
    crate::metrics::record_target_health(&service_id, update.healthy);
    Json(TargetHealth {
        service_id,
        healthy: update.healthy,
    })
}

async fn health_check(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "routes": state.routes.list_all().len(),
        "policies": state.policies.list().len(),
        "route_cache_entries": state.cache.entry_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RouteCacheConfig;
    use crate::route::tests::target;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state() -> AdminState {
        let routes = Arc::new(
            InMemoryRouteRepository::with_routes(vec![RouteDefinition::new(
                "orders",
                "/api/orders/**",
                vec![target("orders-v1", 1, true)],
            )])
            .unwrap(),
        );
        AdminState {
            cache: Arc::new(RouteCache::new(routes.clone(), &RouteCacheConfig::default())),
            routes,
            policies: Arc::new(InMemoryPolicyStore::new()),
            health: Arc::new(HealthRegistry::default()),
            metrics: MetricsService::detached(),
        }
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_route_update_requires_current_version() {
        let state = state();
        let app = router(state.clone());

        let mut definition = state.routes.get("orders").unwrap().definition().clone();
        definition.priority = 5;
        let body = serde_json::to_value(&definition).unwrap();

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/admin/routes/orders", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["version"], 2);

        // Same body again is based on a stale version
        let response = app
            .oneshot(json_request("PUT", "/admin/routes/orders", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_route_rejected() {
        let app = router(state());
        let response = app
            .oneshot(json_request(
                "POST",
                "/admin/routes",
                json!({
                    "route_id": "no spaces allowed",
                    "path_pattern": "/x",
                    "targets": [{"service_id": "a", "target_uri": "http://a"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_route_lifecycle() {
        let state = state();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/admin/routes",
                json!({
                    "route_id": "users",
                    "path_pattern": "/api/users/**",
                    "targets": [{"service_id": "users-v1", "target_uri": "http://users:8080"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(Request::get("/admin/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(
                Request::delete("/admin/routes/users")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(Request::get("/admin/routes/users").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_policy_crud() {
        let state = state();
        let app = router(state.clone());
        let policy = json!({
            "policy_id": "p1",
            "client_id": "*",
            "endpoint": "/api/orders/**",
            "algorithm": "FIXED_WINDOW",
            "max_requests": 10,
            "time_window_seconds": 60
        });

        let response = app
            .clone()
            .oneshot(json_request("POST", "/admin/policies", policy.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/admin/policies", policy))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(
                Request::get("/admin/policies/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.policies.list().len(), 1);
    }

    #[tokio::test]
    async fn test_health_override() {
        let state = state();
        let app = router(state.clone());

        let response = app
            .oneshot(json_request(
                "PUT",
                "/admin/health/orders-v1",
                json!({"healthy": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.health.snapshot(),
            vec![("orders-v1".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_cache_invalidate_and_health_endpoints() {
        let app = router(state());

        let response = app
            .clone()
            .oneshot(
                Request::post("/admin/cache/invalidate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["routes"], 1);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
