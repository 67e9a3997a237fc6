pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;

pub use config::Config;
pub use error::{ApiError, Result};

use axum::{http::Method, Router};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use services::breaker::CircuitBreaker;
use services::providers::ProviderRegistry;
use services::storage::StorageService;

pub struct AppState {
    pub config: Config,
    pub db: PgPool,
    pub http: reqwest::Client,
    pub storage: StorageService,
    pub providers: ProviderRegistry,
    /// Process-local by design: replicas each keep their own failure history.
    pub breaker: CircuitBreaker,
}

impl AppState {
    pub fn new(config: Config, db: PgPool) -> Self {
        let http = reqwest::Client::new();
        let storage = StorageService::new(&config, http.clone());
        let providers = ProviderRegistry::from_config(&config, http.clone());
        let breaker = CircuitBreaker::new(
            config.breaker_threshold,
            std::time::Duration::from_secs(config.breaker_cooldown_secs),
        );

        Self {
            config,
            db,
            http,
            storage,
            providers,
            breaker,
        }
    }
}

fn build_cors(origins: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origins.is_empty() {
        // Development: allow all origins
        cors.allow_origin(Any)
    } else {
        // Production: parse comma-separated origins
        let origins: Vec<_> = origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = build_cors(&state.config.cors_origins);

    Router::new()
        .nest("/api", routes::generation::routes())
        .merge(routes::webhooks::routes())
        .merge(routes::admin::routes())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(
            state.config.request_timeout,
        )))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
