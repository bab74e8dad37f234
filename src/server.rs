//! HTTP server exposing the admission middleware.

use axum::{
    extract::State,
    middleware::from_fn_with_state,
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{QuotaGuardError, Result};
use crate::middleware::{rate_limit_middleware, AdmissionState};
use crate::ratelimit::MetricsSnapshot;

/// Health report served on `/healthz`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    /// Decisions are being made from per-instance counts
    pub degraded: bool,
    pub local_subjects: usize,
    pub metrics: MetricsSnapshot,
}

async fn healthz(State(state): State<AdmissionState>) -> Json<HealthReport> {
    let limiter = &state.limiter;
    Json(HealthReport {
        status: "ok",
        degraded: limiter.is_degraded(),
        local_subjects: limiter.fallback().subject_count(),
        metrics: limiter.metrics().snapshot(),
    })
}

async fn admitted() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "admitted": true }))
}

/// Put `protected` behind the rate limiter and add the unlimited `/healthz`.
pub fn build_router(state: AdmissionState, protected: Router) -> Router {
    let protected = protected.layer(from_fn_with_state(state.clone(), rate_limit_middleware));

    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
        .merge(protected)
}

/// Placeholder for the downstream API: every `/api/*` path answers 200.
pub fn placeholder_api() -> Router {
    Router::new().route("/api/*rest", any(admitted))
}

/// HTTP server for the admission service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            QuotaGuardError::Server(e.to_string())
        })
    }
}
