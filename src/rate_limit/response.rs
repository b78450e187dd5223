use super::types::RateLimitDecision;
use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Attach `X-RateLimit-*` headers for an evaluated policy.
/// Decisions without a policy leave the headers untouched.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    if !decision.is_limited() {
        return;
    }

    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_after_secs));
}

/// 429 Too Many Requests with rate limit headers, `Retry-After` and a JSON body
pub fn rate_limited_response(decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs();

    let mut headers = HeaderMap::new();
    let denied = RateLimitDecision {
        remaining: 0,
        ..decision.clone()
    };
    apply_rate_limit_headers(&mut headers, &denied);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));

    let body = serde_json::json!({
        "error": "Rate limit exceeded",
        "limit": decision.limit,
        "window": decision.window_secs,
        "retryAfter": retry_after,
    });

    (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::types::{RateLimitAlgorithm, RateLimitPolicy, StoreOutcome};
    use http_body_util::BodyExt;

    fn denied() -> RateLimitDecision {
        let policy = RateLimitPolicy::new("p1", "c", "/e", RateLimitAlgorithm::FixedWindow, 100, 60);
        RateLimitDecision::from_outcome(
            &policy,
            StoreOutcome {
                allowed: false,
                remaining: 0,
                reset_after_secs: 30,
            },
        )
    }

    #[tokio::test]
    async fn test_rate_limit_response() {
        let response = rate_limited_response(&denied());

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "100");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "30");
        assert_eq!(headers.get("Retry-After").unwrap(), "30");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": "Rate limit exceeded",
                "limit": 100,
                "window": 60,
                "retryAfter": 30
            })
        );
    }

    #[test]
    fn test_unlimited_decision_adds_no_headers() {
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &RateLimitDecision::unlimited());
        assert!(headers.is_empty());

        let mut allowed = denied();
        allowed.allowed = true;
        allowed.remaining = 41;
        apply_rate_limit_headers(&mut headers, &allowed);
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "41");
    }
}
