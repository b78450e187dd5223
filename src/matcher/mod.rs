//! Condition matching: decides whether a route applies to a request.
//!
//! Evaluation order is fixed and short-circuits on the first failure:
//! liveness, method, path pattern, header conditions, query conditions, body
//! conditions, then the role check. Matching performs no I/O.

use crate::context::RequestContext;
use crate::route::{Condition, Route};
use std::sync::Arc;

/// Result of evaluating one route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched,
    NotLive,
    MethodMismatch,
    PathMismatch,
    HeaderMismatch,
    QueryMismatch,
    BodyMismatch,
    RoleDenied,
}

/// Evaluate `route` against `ctx`
pub fn evaluate(route: &Route, ctx: &RequestContext) -> MatchOutcome {
    if !route.is_live() {
        return MatchOutcome::NotLive;
    }

    if let Some(method) = route.method() {
        if method != ctx.method() {
            return MatchOutcome::MethodMismatch;
        }
    }

    if !route.pattern().is_match(ctx.path()) {
        return MatchOutcome::PathMismatch;
    }

    if !all_hold(route.header_conditions(), |field| ctx.header(field).map(str::to_string)) {
        return MatchOutcome::HeaderMismatch;
    }

    if !all_hold(route.query_conditions(), |field| {
        ctx.query_param(field).map(str::to_string)
    }) {
        return MatchOutcome::QueryMismatch;
    }

    if !all_hold(route.body_conditions(), |field| ctx.body_field(field)) {
        return MatchOutcome::BodyMismatch;
    }

    if !roles_permit(route, &ctx.identity().roles) {
        return MatchOutcome::RoleDenied;
    }

    MatchOutcome::Matched
}

/// `true` when every condition of `route` holds for `ctx`
pub fn matches(route: &Route, ctx: &RequestContext) -> bool {
    evaluate(route, ctx) == MatchOutcome::Matched
}

/// First matching route of an already ordered candidate list
pub fn first_match<'a>(candidates: &'a [Arc<Route>], ctx: &RequestContext) -> Option<&'a Arc<Route>> {
    candidates.iter().find(|route| {
        let outcome = evaluate(route, ctx);
        if outcome != MatchOutcome::Matched {
            tracing::trace!(route_id = %route.id(), ?outcome, "Route rejected");
        }
        outcome == MatchOutcome::Matched
    })
}

fn all_hold<F>(conditions: &[Condition], lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    conditions
        .iter()
        .all(|condition| condition.evaluate(lookup(&condition.field).as_deref()))
}

/// Blocked roles win over allowed roles; an empty allow-list admits everyone
fn roles_permit(route: &Route, roles: &[String]) -> bool {
    if roles.iter().any(|r| route.blocked_roles().contains(r)) {
        return false;
    }
    if route.allowed_roles().is_empty() {
        return true;
    }
    roles.iter().any(|r| route.allowed_roles().contains(r))
}
