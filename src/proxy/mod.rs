//! Backend forwarding over a shared `reqwest` client

use crate::context::{RequestContext, CORRELATION_ID_HEADER, REQUEST_ID_HEADER};
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::route::{Route, TargetService};
use crate::transform::{apply_extra_headers, apply_extra_query};
use axum::{body::Body, http::Response};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::time::Duration;
use tracing::{debug, warn};

pub const ROUTE_ID_HEADER: &str = "x-gateway-route-id";
pub const TARGET_SERVICE_HEADER: &str = "x-gateway-target-service";

/// A fully prepared backend request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Request for a selected target: route transforms, the target's extra
    /// headers and query parameters, then the gateway headers.
    pub fn for_target(
        route: &Route,
        target: &TargetService,
        ctx: &RequestContext,
        body: Bytes,
    ) -> Self {
        let mut headers = forwardable_headers(ctx.headers());

        let (path, query) = match route.transform() {
            Some(transform) => {
                transform.transform_request_headers(&mut headers);
                (
                    transform.transform_path(ctx.path()),
                    transform.transform_query(ctx.raw_query()),
                )
            }
            None => (ctx.path().to_string(), ctx.raw_query().map(str::to_string)),
        };

        apply_extra_headers(&target.extra_headers, &mut headers);
        let query = apply_extra_query(&target.extra_query_params, query);

        insert_header(&mut headers, ROUTE_ID_HEADER, route.id());
        insert_header(&mut headers, TARGET_SERVICE_HEADER, &target.service_id);
        insert_header(&mut headers, REQUEST_ID_HEADER, ctx.request_id());
        insert_header(&mut headers, CORRELATION_ID_HEADER, ctx.correlation_id());

        Self {
            method: ctx.method().clone(),
            url: backend_url(&target.target_uri, &path, query.as_deref()),
            headers,
            body,
        }
    }

    /// Request forwarded as received to the passthrough upstream
    pub fn passthrough(upstream: &str, ctx: &RequestContext, body: Bytes) -> Self {
        Self {
            method: ctx.method().clone(),
            url: backend_url(upstream, ctx.path(), ctx.raw_query()),
            headers: forwardable_headers(ctx.headers()),
            body,
        }
    }
}

/// Sends requests to backends and fans out mirror copies
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// `timeout` bounds every backend round-trip
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Send `request` and buffer the backend response
    pub async fn forward(&self, request: OutboundRequest) -> Result<Response<Body>> {
        debug!(method = %request.method, url = %request.url, "Forwarding to backend");
        send_request(&self.client, request).await
    }

    /// Fire-and-forget copy of `request` to a mirror target; the response is discarded
    pub fn spawn_mirror(&self, target: &TargetService, request: OutboundRequest) {
        let client = self.client.clone();
        let service_id = target.service_id.clone();
        tokio::spawn(async move {
            match send_request(&client, request).await {
                Ok(response) => {
                    debug!(target = %service_id, status = %response.status(), "Mirror request completed");
                    metrics::record_mirror_request(&service_id, "success");
                }
                Err(e) => {
                    warn!(target = %service_id, error = %e, "Mirror request failed");
                    metrics::record_mirror_request(&service_id, "error");
                }
            }
        });
    }
}

async fn send_request(client: &reqwest::Client, request: OutboundRequest) -> Result<Response<Body>> {
    let backend_response = client
        .request(request.method, &request.url)
        .headers(request.headers)
        .body(request.body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(format!("Backend request timed out: {}", e))
            } else if e.is_connect() {
                GatewayError::Backend(format!("Failed to connect to backend: {}", e))
            } else {
                GatewayError::Proxy(format!("Backend request failed: {}", e))
            }
        })?;

    let status = backend_response.status();
    let mut response_builder = Response::builder().status(status);
    for (name, value) in backend_response.headers() {
        if !is_hop_by_hop_header(name.as_str()) {
            response_builder = response_builder.header(name, value);
        }
    }

    let body_bytes = backend_response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::Timeout(format!("Backend response timed out: {}", e))
        } else {
            GatewayError::Backend(format!("Failed to read backend response: {}", e))
        }
    })?;

    response_builder
        .body(Body::from(body_bytes))
        .map_err(|e| GatewayError::Internal(format!("Failed to build response: {}", e)))
}

/// Join a target base URI with the request path and query
pub fn backend_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Inbound headers minus hop-by-hop headers, `Host` and `Content-Length`
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        let recomputed = name == http::header::HOST || name == http::header::CONTENT_LENGTH;
        if !recomputed && !is_hop_by_hop_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => warn!(header = name, "Skipping header with invalid value"),
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context_from;
    use crate::route::tests::target;
    use crate::route::RouteDefinition;
    use crate::transform::TransformConfig;
    use http::Request;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("Keep-Alive"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Authorization"));
    }

    #[test]
    fn test_backend_url() {
        assert_eq!(
            backend_url("http://orders:8080/", "/api/orders", Some("a=1")),
            "http://orders:8080/api/orders?a=1"
        );
        assert_eq!(
            backend_url("http://orders:8080", "/api/orders", Some("")),
            "http://orders:8080/api/orders"
        );
    }

    #[test]
    fn test_outbound_request_for_target() {
        let mut definition =
            RouteDefinition::new("orders", "/api/orders/**", vec![target("orders-v1", 1, true)]);
        definition.targets[0].extra_headers =
            [("X-Version".to_string(), "v1".to_string())].into_iter().collect();
        definition.targets[0].extra_query_params =
            [("tier".to_string(), "gold".to_string())].into_iter().collect();
        let transform: TransformConfig = serde_yaml::from_str(
            r#"
request_headers:
  remove: ["X-Debug"]
  rename:
    X-Legacy: X-Modern
"#,
        )
        .unwrap();
        definition.transform = Some(transform);
        let route = Route::new(definition).unwrap();

        let ctx = context_from(
            Request::builder()
                .method("POST")
                .uri("/api/orders/42?expand=items")
                .header("Host", "gateway.local")
                .header("Connection", "keep-alive")
                .header("X-Debug", "1")
                .header("X-Legacy", "yes")
                .header("X-Request-ID", "req-1")
                .body(Bytes::new())
                .unwrap(),
            "10.0.0.1",
        );

        let outbound = OutboundRequest::for_target(
            &route,
            &route.targets()[0],
            &ctx,
            Bytes::from_static(b"{}"),
        );

        assert_eq!(outbound.method, Method::POST);
        assert!(outbound.url.starts_with("http://orders-v1.internal:8080/api/orders/42?"));
        assert!(outbound.url.contains("expand=items"));
        assert!(outbound.url.contains("tier=gold"));

        let headers = &outbound.headers;
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-debug").is_none());
        assert_eq!(headers.get("x-modern").unwrap(), "yes");
        assert_eq!(headers.get("x-version").unwrap(), "v1");
        assert_eq!(headers.get(ROUTE_ID_HEADER).unwrap(), "orders");
        assert_eq!(headers.get(TARGET_SERVICE_HEADER).unwrap(), "orders-v1");
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-1");
        assert_eq!(headers.get(CORRELATION_ID_HEADER).unwrap(), "req-1");
    }

    #[test]
    fn test_passthrough_request_is_unmodified() {
        let ctx = context_from(
            Request::builder()
                .uri("/legacy/thing?x=1&y=2")
                .header("X-Custom", "keep")
                .body(Bytes::new())
                .unwrap(),
            "10.0.0.1",
        );

        let outbound = OutboundRequest::passthrough("http://legacy:9000", &ctx, Bytes::new());
        assert_eq!(outbound.url, "http://legacy:9000/legacy/thing?x=1&y=2");
        assert_eq!(outbound.headers.get("x-custom").unwrap(), "keep");
        assert!(outbound.headers.get(ROUTE_ID_HEADER).is_none());
        assert!(outbound.headers.get(REQUEST_ID_HEADER).is_none());
    }

    #[test]
    fn test_forwarder_creation() {
        assert!(Forwarder::new(Duration::from_secs(30)).is_ok());
    }
}
