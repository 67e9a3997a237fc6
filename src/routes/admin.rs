use axum::{extract::State, routing::post, Json, Router};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    error::{ApiError, Result},
    services::{credits, recovery::ScanReport},
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/recovery", post(run_recovery))
        .route("/admin/account", post(create_account))
}

fn require_admin(state: &AppState, token: &str) -> Result<()> {
    // Constant-time comparison to prevent timing attacks
    let is_valid = match &state.config.admin_token {
        Some(expected) => {
            let a = expected.as_bytes();
            let b = token.as_bytes();
            a.len() == b.len() && a.ct_eq(b).into()
        }
        None => false,
    };

    if is_valid {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Operator-facing manual trigger: one scan pass, aggregate counts back.
async fn run_recovery(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
) -> Result<Json<ScanReport>> {
    require_admin(&state, auth.token())?;

    let report = crate::services::recovery::run_scan(&state).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    #[serde(default)]
    account_id: Option<Uuid>,
    #[serde(default = "default_tier")]
    tier: String,
    #[serde(default)]
    is_admin: bool,
    #[serde(default = "default_credits")]
    credits: f64,
}

fn default_tier() -> String {
    "free".to_string()
}

fn default_credits() -> f64 {
    10.0
}

#[derive(Debug, Serialize)]
struct CreateAccountResponse {
    account_id: Uuid,
    api_key: String,
    tier: String,
    balance: f64,
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<Json<CreateAccountResponse>> {
    require_admin(&state, auth.token())?;

    let account_id = req.account_id.unwrap_or_else(Uuid::new_v4);
    let api_key = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO accounts (id, tier, is_admin)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE SET tier = $2, is_admin = $3
        "#,
    )
    .bind(account_id)
    .bind(&req.tier)
    .bind(req.is_admin)
    .execute(&state.db)
    .await?;

    sqlx::query("INSERT INTO api_keys (key, account_id) VALUES ($1, $2)")
        .bind(&api_key)
        .bind(account_id)
        .execute(&state.db)
        .await?;

    credits::grant(&state.db, account_id, req.credits, "admin grant").await?;
    let balance = credits::balance(&state.db, account_id).await?;

    Ok(Json(CreateAccountResponse {
        account_id,
        api_key,
        tier: req.tier,
        balance,
    }))
}
