use std::sync::Arc;

use anyhow::{Context, Result};
use axum::middleware;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentinel_backend::api::{create_router, AppState};
use sentinel_backend::backtest::BacktestRunner;
use sentinel_backend::engine::Engine;
use sentinel_backend::middleware::request_logging;
use sentinel_backend::models::Config;
use sentinel_backend::shadow::ShadowManager;
use sentinel_backend::storage::Database;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    let db = Arc::new(
        Database::new(&config.database_path)
            .with_context(|| format!("Failed to open database at {}", config.database_path))?,
    );
    info!("Database initialized at: {}", config.database_path);

    let engine = Arc::new(Engine::new(db).context("Failed to build evaluation engine")?);
    let shadow = Arc::new(ShadowManager::new(engine.clone()));
    let backtests = BacktestRunner::new(engine.clone(), config.backtest_max_events);

    let active = engine.active_snapshot();
    info!(
        "Active config v{} loaded with {} rules",
        active.version,
        active.rules.len()
    );

    let app = create_router(AppState {
        engine,
        shadow,
        backtests,
    })
    .layer(middleware::from_fn(request_logging))
    .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentinel_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
