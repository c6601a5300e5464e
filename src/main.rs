//! ChatVault Gateway - Main entry point
//!
//! This binary loads configuration, wires the load balancer, rate limiter and
//! usage store together, and serves the HTTP API until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use chatvault_gateway::{
    api::{create_router, AppState, Authenticator, OpenAiCompatibleClient},
    core::{
        init_metrics, AppConfig, CancellationSignal, Database, DatabaseConfig, DatabaseUsageStore,
        MemoryUsageStore, RateLimiter, StaticRateLimitResolver, UsageStore,
    },
    services::{CompletionRouter, HttpHealthChecker, LoadBalancer, ModelRegistry, StaticCostTable},
};
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        builder.worker_threads(threads);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async_main())
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

fn init_tracing() {
    let no_color = std::env::var("NO_COLOR").is_ok();
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let base_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,chatvault_gateway=debug".to_string());

    // Noise filters are appended even when RUST_LOG is set
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    ));

    let output = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(LocalTime)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_timer(LocalTime)
            .with_ansi(!no_color)
            .boxed()
    };

    tracing_subscriber::registry().with(filter).with(output).init();
}

async fn async_main() -> Result<()> {
    init_tracing();
    init_metrics();

    let config = AppConfig::load_default()?;
    let config = Arc::new(config);

    let http_client = create_http_client(&config)?;

    // Usage persistence: PostgreSQL when configured, in-memory otherwise
    let mut database_store: Option<Arc<DatabaseUsageStore>> = None;
    let usage_store: Arc<dyn UsageStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let db = Database::connect(&DatabaseConfig::from_url(url))
                .await
                .context("Failed to connect to database")?;
            db.ensure_schema()
                .await
                .context("Failed to create usage_logs schema")?;
            tracing::info!("Database connected successfully");
            let store = Arc::new(DatabaseUsageStore::new(db.pool().clone()));
            database_store = Some(Arc::clone(&store));
            store
        }
        None => {
            tracing::warn!("DATABASE_URL not set, usage records are kept in memory only");
            Arc::new(MemoryUsageStore::default())
        }
    };

    let models = Arc::new(ModelRegistry::from_config(&config));
    tracing::info!("Loaded {} models", models.len());

    let load_balancer = Arc::new(LoadBalancer::from_config(&config));
    load_balancer.start_health_checks(Arc::new(HttpHealthChecker::new(http_client.clone())));

    let rate_settings = &config.router_settings.rate_limit_per_user;
    let rate_limiter = Arc::new(RateLimiter::new(Arc::new(
        StaticRateLimitResolver::from_config(&config),
    )));
    let cleanup_cancel = CancellationSignal::new();
    let cleanup_handle = rate_limiter.spawn_cleanup(
        Duration::from_secs(rate_settings.cleanup_interval_secs.max(1)),
        cleanup_cancel.clone(),
    );

    let router = CompletionRouter::new(
        models,
        Arc::clone(&load_balancer),
        Arc::new(OpenAiCompatibleClient::new(http_client)),
        usage_store,
        Arc::new(StaticCostTable::from_config(&config)),
    )
    .with_cost_calculation(config.enable_cost_calculation)
    .with_usage_logging(config.enable_usage_logging);

    let state = AppState {
        config: Arc::clone(&config),
        router: Arc::new(router),
        rate_limiter,
        authenticator: Arc::new(Authenticator::new(&config.auth, &config.clients)),
        database_configured: database_store.is_some(),
    };

    let app = create_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Starting ChatVault Gateway on {}", addr);
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/models");
    tracing::info!("Swagger UI: /swagger-ui");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down background tasks");
    load_balancer.stop_health_checks().await;
    cleanup_cancel.cancel();
    if let Err(e) = cleanup_handle.await {
        tracing::error!("Rate limit cleanup task ended abnormally: {}", e);
    }
    if let Some(store) = database_store {
        store.shutdown().await;
    }

    Ok(())
}

/// Create HTTP client with connection pooling
fn create_http_client(config: &AppConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.verify_ssl)
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
