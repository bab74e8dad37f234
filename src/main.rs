use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::config::QuotaGuardConfig;
use quotaguard::middleware::AdmissionState;
use quotaguard::ratelimit::{
    Clock, LocalCounterStore, RateLimiter, RedisCounterStore, SystemClock, TierPolicyTable,
};
use quotaguard::server::{build_router, placeholder_api, HttpServer};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Tiered admission control service.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Redis URL for the shared counter store, overriding the configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }

    info!("Starting Quotaguard Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = QuotaGuardConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.listen {
        config.server.http_addr = addr;
    }
    if let Some(url) = cli.redis_url {
        config.store.redis_url = Some(url);
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let policies = TierPolicyTable::from_config(&config.tiers)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let fallback = Arc::new(LocalCounterStore::new(clock.clone(), config.local.max_subjects));
    let sweeper = fallback.clone().spawn_sweeper(config.local.sweep_interval());

    let mut limiter = RateLimiter::new(policies, fallback, clock);
    match &config.store.redis_url {
        Some(url) => {
            let store = RedisCounterStore::new(url, config.store.redis_config())?;
            limiter = limiter.with_shared_store(Arc::new(store), config.store.fallback_cooldown());
            info!(
                key_prefix = %config.store.key_prefix,
                timeout_ms = config.store.timeout_ms,
                "Shared counter store configured"
            );
        }
        None => {
            warn!("No redis_url configured, limits are enforced per instance only");
        }
    }
    info!("Rate limiter initialized");

    let state = AdmissionState::new(Arc::new(limiter), config.server.trust_forwarded_for);
    let server = HttpServer::new(config.server.http_addr, build_router(state, placeholder_api()));

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.abort();
    info!("Quotaguard Admission Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
