use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tracing::info;

use crate::{
    error::{ApiError, Result},
    services::{
        dispatch,
        providers::{first_output_url, Provider},
        webhook,
    },
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks/:provider", post(provider_callback))
}

/// Completion callback body as sent by async providers: the task object with
/// an optional echo of our per-job token.
#[derive(Debug, Deserialize)]
struct CallbackEvent {
    id: Option<String>,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug)]
enum TerminalOutcome {
    Complete(String),
    Fail,
}

/// The terminal outcome a delivery carries, if any. A success without an
/// output URL is a failure (the job can never complete); progress statuses
/// map to None.
fn terminal_outcome(status: &str, output: Option<&serde_json::Value>) -> Option<TerminalOutcome> {
    match status {
        "succeeded" | "completed" => Some(match output.and_then(first_output_url) {
            Some(url) => TerminalOutcome::Complete(url),
            None => TerminalOutcome::Fail,
        }),
        "failed" | "canceled" => Some(TerminalOutcome::Fail),
        _ => None,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn provider_callback(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let provider = state
        .providers
        .get(&provider_name)
        .ok_or(ApiError::NotFound)?;

    // synchronous providers never deliver callbacks
    let secret = provider.webhook_secret().ok_or(ApiError::Unauthorized)?;

    let signature = header_str(&headers, "x-webhook-signature").ok_or(ApiError::Unauthorized)?;
    let payload =
        std::str::from_utf8(&body).map_err(|_| ApiError::Validation("invalid body".into()))?;

    if !webhook::verify_signature(
        secret,
        signature,
        payload,
        Utc::now().timestamp(),
        state.config.webhook_tolerance_secs,
    ) {
        return Err(ApiError::Unauthorized);
    }

    let event: CallbackEvent = serde_json::from_str(payload)
        .map_err(|e| ApiError::Validation(format!("invalid event: {e}")))?;

    let task_id = event
        .id
        .as_deref()
        .ok_or_else(|| ApiError::Validation("missing task id".into()))?;

    let job = webhook_job(&state, provider.name(), task_id).await?;

    // second verification layer: the random token embedded at job creation
    // must echo back, so a forged callback needs more than a guessed id
    let token = params
        .get("token")
        .map(String::as_str)
        .or(event.token.as_deref())
        .unwrap_or("");
    if !webhook::constant_time_eq(token.as_bytes(), job.callback_token.as_bytes()) {
        return Err(ApiError::Unauthorized);
    }

    let key = webhook::idempotency_key(
        header_str(&headers, "x-event-id"),
        Some(task_id),
        header_str(&headers, "x-delivery-id"),
    )
    .ok_or_else(|| ApiError::Validation("missing idempotency key".into()))?;

    if webhook::already_processed(&state.db, &key).await? {
        // idempotent ack: same response class as first delivery
        return Ok(Json(json!({ "status": "ok", "duplicate": true })));
    }

    // progress events are acknowledged without touching the dedup ledger,
    // so they can never shadow the terminal delivery for the same task
    let Some(outcome) = terminal_outcome(&event.status, event.output.as_ref()) else {
        return Ok(Json(json!({ "status": "ok" })));
    };

    match outcome {
        TerminalOutcome::Complete(url) => {
            let applied = dispatch::finalize_success_from_url(&state, &job, &url).await?;
            info!(job_id = %job.id, applied, "webhook completion applied");
        }
        TerminalOutcome::Fail => {
            if let Some(reason) = &event.error {
                info!(job_id = %job.id, "provider reported failure: {reason}");
            }
            dispatch::finalize_failure(
                &state.db,
                job.id,
                job.account_id,
                job.credits_reserved,
                "provider_failed",
            )
            .await?;
        }
    }

    webhook::record_event(&state.db, &key, job.id).await?;

    Ok(Json(json!({ "status": "ok" })))
}

async fn webhook_job(
    state: &Arc<AppState>,
    provider: &str,
    task_id: &str,
) -> Result<crate::models::Job> {
    crate::services::jobs::find_by_task(&state.db, provider, task_id)
        .await?
        .ok_or(ApiError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_events_carry_no_terminal_outcome() {
        assert!(terminal_outcome("starting", None).is_none());
        assert!(terminal_outcome("processing", Some(&json!("https://x/a.png"))).is_none());
        assert!(terminal_outcome("queued", None).is_none());
    }

    #[test]
    fn terminal_outcomes_map_status_and_output() {
        match terminal_outcome("succeeded", Some(&json!(["https://x/a.png"]))) {
            Some(TerminalOutcome::Complete(url)) => assert_eq!(url, "https://x/a.png"),
            other => panic!("expected complete, got {other:?}"),
        }
        // a success with nothing to deliver can never complete the job
        assert!(matches!(
            terminal_outcome("succeeded", None),
            Some(TerminalOutcome::Fail)
        ));
        assert!(matches!(
            terminal_outcome("failed", None),
            Some(TerminalOutcome::Fail)
        ));
        assert!(matches!(
            terminal_outcome("canceled", Some(&json!("https://x/a.png"))),
            Some(TerminalOutcome::Fail)
        ));
    }
}
