//! Request orchestration.
//!
//! Every inbound request walks the same states:
//!
//! ```text
//! BUILT -> MATCHED | PASSTHROUGH
//! MATCHED -> RATE_CHECKED(ALLOWED | DENIED)
//! RATE_CHECKED(ALLOWED) -> TARGET_SELECTED -> FORWARDED -> COMPLETED(SUCCESS | ERROR)
//! ```
//!
//! A denied request completes with 429; a selection failure completes with
//! the selector's error.

use crate::cache::RouteCache;
use crate::context::{ContextBuilder, RequestContext, REQUEST_ID_HEADER};
use crate::error::GatewayError;
use crate::matcher;
use crate::metrics::{self, RequestTimer};
use crate::proxy::{Forwarder, OutboundRequest};
use crate::rate_limit::{
    apply_rate_limit_headers, rate_limited_response, types::RateLimitSubject, RateLimiterService,
};
use crate::route::Route;
use crate::selector::{HealthRegistry, HealthSource, TargetSelector};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, Response},
    response::IntoResponse,
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of the rate-limit step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    Allowed,
    Denied,
}

/// Outcome of a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Error,
}

/// Pipeline state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Built,
    Matched,
    Passthrough,
    RateChecked(RateOutcome),
    TargetSelected,
    Forwarded,
    Completed(Completion),
}

impl RequestState {
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Built, Matched)
                | (Built, Passthrough)
                | (Passthrough, Completed(_))
                | (Matched, RateChecked(_))
                | (RateChecked(RateOutcome::Denied), Completed(_))
                | (RateChecked(RateOutcome::Allowed), TargetSelected)
                | (RateChecked(RateOutcome::Allowed), Completed(Completion::Error))
                | (TargetSelected, Forwarded)
                | (Forwarded, Completed(_))
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Built => write!(f, "BUILT"),
            RequestState::Matched => write!(f, "MATCHED"),
            RequestState::Passthrough => write!(f, "PASSTHROUGH"),
            RequestState::RateChecked(RateOutcome::Allowed) => write!(f, "RATE_CHECKED(ALLOWED)"),
            RequestState::RateChecked(RateOutcome::Denied) => write!(f, "RATE_CHECKED(DENIED)"),
            RequestState::TargetSelected => write!(f, "TARGET_SELECTED"),
            RequestState::Forwarded => write!(f, "FORWARDED"),
            RequestState::Completed(Completion::Success) => write!(f, "COMPLETED(SUCCESS)"),
            RequestState::Completed(Completion::Error) => write!(f, "COMPLETED(ERROR)"),
        }
    }
}

/// Per-request state tracker
struct Exchange {
    request_id: String,
    state: RequestState,
}

impl Exchange {
    fn new(ctx: &RequestContext) -> Self {
        Self {
            request_id: ctx.request_id().to_string(),
            state: RequestState::Built,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!(request_id = %self.request_id, from = %self.state, to = %next, "Request state");
        self.state = next;
    }
}

/// Shared state of the gateway handler
#[derive(Clone)]
pub struct GatewayPipeline {
    pub cache: Arc<RouteCache>,
    pub contexts: Arc<ContextBuilder>,
    pub rate_limiter: Arc<RateLimiterService>,
    pub selector: TargetSelector,
    pub health: Arc<HealthRegistry>,
    pub forwarder: Forwarder,
    /// Upstream for requests no route matches; `None` answers 404
    pub passthrough_upstream: Option<String>,
    /// Requests with a larger body are answered with 413
    pub max_body_bytes: usize,
}

impl GatewayPipeline {
    /// Run one request through the pipeline
    pub async fn handle(&self, request: Request<Body>, client_ip: IpAddr) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                warn!(limit = self.max_body_bytes, "Request body too large");
                return GatewayError::PayloadTooLarge {
                    limit: self.max_body_bytes,
                }
                .into_response();
            }
            Err(e) => {
                return GatewayError::Proxy(format!("Failed to read request body: {}", e))
                    .into_response()
            }
        };

        let ctx = self.contexts.build(&parts, &body, client_ip);
        let mut exchange = Exchange::new(&ctx);

        info!(
            request_id = %ctx.request_id(),
            method = %ctx.method(),
            path = %ctx.path(),
            client_ip = %client_ip,
            "Incoming request"
        );

        let candidates = self.cache.lookup(ctx.method(), ctx.path()).await;
        let route = match matcher::first_match(&candidates, &ctx) {
            Some(route) => route.clone(),
            None => {
                exchange.advance(RequestState::Passthrough);
                let response = self.passthrough(&ctx, body).await;
                exchange.advance(RequestState::Completed(completion_of(&response)));
                return response;
            }
        };
        exchange.advance(RequestState::Matched);

        let mut response = self.handle_routed(&route, &ctx, body, &mut exchange).await;
        if let Ok(value) = HeaderValue::from_str(ctx.request_id()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }

    async fn handle_routed(
        &self,
        route: &Route,
        ctx: &RequestContext,
        body: Bytes,
        exchange: &mut Exchange,
    ) -> Response<Body> {
        let mut timer = RequestTimer::start(route.id());
        let client_id = ctx.client_identity();

        let identity = ctx.identity();
        let subject = RateLimitSubject {
            client_id: &client_id,
            endpoint: route.endpoint(),
            api_key: identity.api_key.as_deref(),
            tenant_id: identity.tenant_id.as_deref(),
        };
        let decision = self.rate_limiter.check_subject(&subject, 1).await;

        if !decision.allowed {
            exchange.advance(RequestState::RateChecked(RateOutcome::Denied));
            warn!(
                route_id = %route.id(),
                client_id = %client_id,
                policy_id = decision.policy_id.as_deref().unwrap_or_default(),
                reason = "rate_limit_exceeded",
                limit = decision.limit,
                retry_after = decision.retry_after_secs(),
                "Request denied"
            );
            metrics::record_rate_limit_exceeded(route.id());
            timer.record("rate_limited");
            exchange.advance(RequestState::Completed(Completion::Error));
            return rate_limited_response(&decision);
        }
        exchange.advance(RequestState::RateChecked(RateOutcome::Allowed));

        let selection = match self.selector.select(route, ctx) {
            Ok(selection) => selection,
            Err(e) => {
                if let GatewayError::GeoBlocked { country, .. } = &e {
                    warn!(
                        route_id = %route.id(),
                        client_id = %client_id,
                        country = %country,
                        reason = "geo_blocked",
                        "Request denied"
                    );
                    metrics::record_geo_blocked(route.id());
                } else {
                    warn!(route_id = %route.id(), error = %e, "Target selection failed");
                }
                timer.record("error");
                exchange.advance(RequestState::Completed(Completion::Error));
                return e.into_response();
            }
        };
        exchange.advance(RequestState::TargetSelected);

        let target = &selection.target;
        timer.set_target(target.service_id.as_str());

        for mirror in &selection.mirrors {
            let copy = OutboundRequest::for_target(route, mirror, ctx, body.clone());
            self.forwarder.spawn_mirror(mirror, copy);
        }

        let outbound = OutboundRequest::for_target(route, target, ctx, body);
        let result = self.forwarder.forward(outbound).await;
        exchange.advance(RequestState::Forwarded);

        match result {
            Ok(mut response) => {
                let failed = response.status().is_server_error();
                self.record_health(&target.service_id, !failed);

                if let Some(transform) = route.transform() {
                    transform.transform_response_headers(response.headers_mut());
                }
                apply_rate_limit_headers(response.headers_mut(), &decision);

                info!(
                    route_id = %route.id(),
                    target = %target.service_id,
                    status = %response.status(),
                    latency_ms = timer.elapsed() * 1000.0,
                    "Request completed"
                );
                let completion = if failed {
                    Completion::Error
                } else {
                    Completion::Success
                };
                timer.record(outcome_label(completion));
                exchange.advance(RequestState::Completed(completion));
                response
            }
            Err(e) => {
                self.record_health(&target.service_id, false);
                warn!(
                    route_id = %route.id(),
                    target = %target.service_id,
                    error = %e,
                    latency_ms = timer.elapsed() * 1000.0,
                    "Request failed"
                );
                timer.record("error");
                exchange.advance(RequestState::Completed(Completion::Error));
                e.into_response()
            }
        }
    }

    async fn passthrough(&self, ctx: &RequestContext, body: Bytes) -> Response<Body> {
        let Some(upstream) = &self.passthrough_upstream else {
            debug!(path = %ctx.path(), "No route matched and no passthrough upstream");
            metrics::record_passthrough("not_found");
            return GatewayError::RouteNotFound(ctx.path().to_string()).into_response();
        };

        let outbound = OutboundRequest::passthrough(upstream, ctx, body);
        match self.forwarder.forward(outbound).await {
            Ok(response) => {
                debug!(path = %ctx.path(), status = %response.status(), "Passthrough completed");
                metrics::record_passthrough("forwarded");
                response
            }
            Err(e) => {
                warn!(path = %ctx.path(), error = %e, "Passthrough failed");
                metrics::record_passthrough("error");
                e.into_response()
            }
        }
    }

    fn record_health(&self, service_id: &str, success: bool) {
        if success {
            self.health.record_success(service_id);
        } else {
            self.health.record_failure(service_id);
        }
        metrics::record_target_health(service_id, self.health.is_healthy(service_id));
    }
}

fn completion_of(response: &Response<Body>) -> Completion {
    if response.status().is_client_error() || response.status().is_server_error() {
        Completion::Error
    } else {
        Completion::Success
    }
}

fn outcome_label(completion: Completion) -> &'static str {
    match completion {
        Completion::Success => "success",
        Completion::Error => "error",
    }
}

/// Catch-all axum handler
pub async fn gateway_handler(
    State(pipeline): State<GatewayPipeline>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
) -> Response<Body> {
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    pipeline.handle(request, client_ip).await
}

/// Public router: every path goes through the pipeline
pub fn router(pipeline: GatewayPipeline) -> axum::Router {
    axum::Router::new()
        .fallback(gateway_handler)
        .with_state(pipeline)
}
