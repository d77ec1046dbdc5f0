mod api;
mod auth;
mod config;
mod db;
mod error;
mod jobs;
mod models;
mod parser;
mod security;
mod tools;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::http::HeaderValue;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    auth::JwtKeys,
    config::AppConfig,
    jobs::{ProcessExecutor, RateLimiter, ScanOrchestrator},
    tools::ToolRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub orchestrator: ScanOrchestrator,
    pub config: Arc<AppConfig>,
    pub jwt: Arc<JwtKeys>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);
    if config.jwt_secret == "change-me" {
        warn!("using the default JWT secret; set ASMHAWK_JWT_SECRET");
    }

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let registry = Arc::new(ToolRegistry::from_config(&config));
    let executor = Arc::new(ProcessExecutor::from_config(&config));
    let orchestrator = ScanOrchestrator::start(pool.clone(), registry.clone(), executor, &config);
    orchestrator
        .recover_interrupted()
        .await
        .context("failed to recover scans from previous run")?;

    let state = AppState {
        pool,
        orchestrator,
        config: config.clone(),
        jwt: Arc::new(JwtKeys::new(&config.jwt_secret)),
        rate_limiter: Arc::new(Mutex::new(RateLimiter::new(config.submissions_per_minute))),
    };

    let app = api::router(state)
        .layer(cors_layer(&config)?)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(
        %addr,
        tools = registry.tools().len(),
        runtime = %config.container_runtime,
        "asmhawk-rs listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn cors_layer(config: &AppConfig) -> anyhow::Result<CorsLayer> {
    match &config.cors_origin {
        Some(origin) => {
            let origin: HeaderValue = origin.parse().context("invalid cors_origin")?;
            Ok(CorsLayer::permissive().allow_origin(origin))
        }
        None => Ok(CorsLayer::permissive()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
