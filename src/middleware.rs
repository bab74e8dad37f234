//! Axum middleware applying admission decisions to HTTP requests.
//!
//! Allowed requests continue to the inner handler and carry the quota
//! headers on the response. Rejected requests get a 429 with `Retry-After`
//! and never reach the handler. When no counts can be obtained the request
//! fails closed with a 500, which is kept distinct from a 429 in both logs
//! and metrics.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error};

use crate::ratelimit::{
    Admission, Decision, Principal, RateLimiter, RateSubject, RequestContext, UNKNOWN_ORIGIN,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_BURST_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-burst-limit");
pub const X_RATELIMIT_BURST_REMAINING: HeaderName =
    HeaderName::from_static("x-ratelimit-burst-remaining");
pub const X_RATELIMIT_BURST_RESET: HeaderName = HeaderName::from_static("x-ratelimit-burst-reset");

/// Shared state for the rate limit middleware.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    pub limiter: Arc<RateLimiter>,
    /// Read the caller address from proxy headers
    pub trust_forwarded_for: bool,
}

impl AdmissionState {
    pub fn new(limiter: Arc<RateLimiter>, trust_forwarded_for: bool) -> Self {
        Self {
            limiter,
            trust_forwarded_for,
        }
    }
}

/// Body of a 429 response.
#[derive(Debug, Serialize)]
struct RateLimitedBody {
    error: &'static str,
    message: String,
    tier: &'static str,
    retry_after_secs: u64,
    limit: u64,
    burst_limit: u64,
}

/// Body of a fail-closed 500 response.
#[derive(Debug, Serialize)]
struct UnavailableBody {
    error: &'static str,
    message: &'static str,
}

/// Rate limit middleware.
///
/// ```ignore
/// let app = Router::new()
///     .route("/api/v1/benchmarks", get(list_benchmarks))
///     .layer(axum::middleware::from_fn_with_state(state, rate_limit_middleware));
/// ```
pub async fn rate_limit_middleware(
    State(state): State<AdmissionState>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = request_context(&request, state.trust_forwarded_for);
    let subject = RateSubject::resolve(&context);

    match state.limiter.check(&subject).await {
        Ok(Admission {
            tier,
            source,
            decision,
        }) if decision.allowed => {
            debug!(
                subject = %subject,
                tier = %tier,
                source = source.as_str(),
                remaining = decision.remaining(),
                burst_remaining = decision.burst_remaining(),
                "Rate limit check passed"
            );

            request.extensions_mut().insert(decision.clone());
            let mut response = next.run(request).await;
            insert_quota_headers(response.headers_mut(), &decision);
            response
        }
        Ok(Admission { tier, decision, .. }) => rejected_response(tier.as_str(), &decision),
        Err(err) => {
            error!(subject = %subject, error = %err, "Rate limiter failed, rejecting request");
            let body = UnavailableBody {
                error: "rate_limiter_unavailable",
                message: "Request could not be admitted. Please retry later.",
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

fn rejected_response(tier: &'static str, decision: &Decision) -> Response {
    let retry_after_secs = decision.retry_after_secs().unwrap_or(1);
    let body = RateLimitedBody {
        error: "rate_limit_exceeded",
        message: format!("Rate limit exceeded. Try again in {} seconds.", retry_after_secs),
        tier,
        retry_after_secs,
        limit: decision.limit,
        burst_limit: decision.burst_limit,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    insert_quota_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

/// Attach the six quota headers; resets are epoch seconds.
pub fn insert_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(decision.remaining()),
    );
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at_hourly.timestamp()),
    );
    headers.insert(
        X_RATELIMIT_BURST_LIMIT,
        HeaderValue::from(decision.burst_limit),
    );
    headers.insert(
        X_RATELIMIT_BURST_REMAINING,
        HeaderValue::from(decision.burst_remaining()),
    );
    headers.insert(
        X_RATELIMIT_BURST_RESET,
        HeaderValue::from(decision.reset_at_burst.timestamp()),
    );
}

/// Build the rate limiter's view of a request.
///
/// The principal comes from a `Principal` extension set by the auth layer.
pub fn request_context(request: &Request, trust_forwarded_for: bool) -> RequestContext {
    let principal = request.extensions().get::<Principal>().cloned();

    let forwarded = if trust_forwarded_for {
        forwarded_ip(request.headers())
    } else {
        None
    };
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let origin = forwarded
        .or(peer)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string());

    RequestContext { principal, origin }
}

/// Extract client IP from proxy headers
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    // Leftmost X-Forwarded-For entry is the original client
    let xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());

    xff.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse().ok())
    })
}
