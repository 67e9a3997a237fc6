use anyhow::Context;
use mediaforge::{build_app, worker, AppState, Config};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .context("failed to run migrations")?;

    let state = Arc::new(AppState::new(config, db));

    state.storage.ensure_bucket_exists().await.ok();

    // scheduled recovery sweep, independent of request handling
    let worker_state = state.clone();
    tokio::spawn(async move {
        worker::run_recovery_loop(worker_state).await;
    });

    let addr = format!("{}:{}", state.config.host, state.config.port);
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, build_app(state))
        .await
        .context("server failed")?;

    Ok(())
}
