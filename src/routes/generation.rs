use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    auth::Caller,
    error::{ApiError, Result},
    models::{GenerateRequest, GenerateResponse, JobView},
    services::{credits, dispatch, jobs},
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate", post(generate))
        .route("/generate/:job_id", get(job_status))
        .route("/credits", get(balance))
        .route("/providers", get(list_providers))
}

async fn generate(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>> {
    let response = dispatch::submit(&state, &caller, &request).await?;
    Ok(Json(response))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>> {
    let job = jobs::fetch(&state.db, job_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if job.account_id != caller.account_id && !caller.is_admin {
        return Err(ApiError::NotFound);
    }

    Ok(Json(job.into()))
}

async fn balance(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<serde_json::Value>> {
    let balance = credits::balance(&state.db, caller.account_id).await?;
    Ok(Json(json!({ "balance": balance })))
}

async fn list_providers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "providers": state.providers.names() }))
}
