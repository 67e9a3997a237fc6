//! Generation orchestrator: admission, reservation, job creation, provider
//! dispatch, and the guarded terminal transitions every finalize path
//! (inline, webhook, recovery) funnels through.
//!
//! Central invariant: a successful reservation is paired with exactly one of
//! {deduction confirmed, refund} before the job reaches a terminal state. The
//! reservation guard makes the refund side unskippable on every exit from
//! this routine, panics included.

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::Caller;
use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::models::{ContentType, GenerateRequest, GenerateResponse, Job, JobState};
use crate::services::providers::{Dispatch, Provider, ProviderError, SyncArtifact};
use crate::services::{admission, credits, jobs, storage};
use crate::AppState;

pub fn job_cost(config: &Config, content_type: ContentType, provider: &dyn Provider) -> f64 {
    config.base_cost(content_type) * provider.cost_multiplier()
}

pub fn generate_callback_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Refund-on-drop guard for a credit reservation. Armed from reserve until
/// the credit outcome has a durable owner (terminal transition applied, async
/// handoff recorded, or continuation spawned). Drop while armed spawns the
/// refund, which also covers panic unwinds out of the dispatch routine.
struct ReservationGuard {
    db: PgPool,
    account_id: Uuid,
    amount: f64,
    armed: bool,
}

impl ReservationGuard {
    fn new(db: PgPool, account_id: Uuid, amount: f64) -> Self {
        Self {
            db,
            account_id,
            amount,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Explicit refund for ordinary error paths, so the caller can await it.
    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = credits::refund(&self.db, self.account_id, self.amount).await {
            error!(account_id = %self.account_id, "reservation release refund failed: {e}");
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            account_id = %self.account_id,
            amount = self.amount,
            "reservation guard dropped while armed, refunding in background"
        );
        let db = self.db.clone();
        let account_id = self.account_id;
        let amount = self.amount;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = credits::refund(&db, account_id, amount).await {
                    error!(%account_id, "guard refund failed: {e}");
                }
            });
        }
    }
}

pub async fn submit(
    state: &Arc<AppState>,
    caller: &Caller,
    request: &GenerateRequest,
) -> Result<GenerateResponse> {
    // validation first: no side effects on any of these failures
    let provider = state
        .providers
        .get(&request.provider)
        .ok_or_else(|| ApiError::Validation(format!("unknown provider: {}", request.provider)))?;

    let content_type = ContentType::parse(&request.content_type)
        .ok_or_else(|| ApiError::Validation("content_type must be image, video or audio".into()))?;

    if !provider.supports(content_type) {
        return Err(ApiError::Validation(format!(
            "provider {} does not support {}",
            provider.name(),
            content_type.as_str()
        )));
    }

    let normalized = provider.normalize(content_type, &request.params)?;

    admission::check(&state.db, caller, request.retry_of).await?;

    let cost = job_cost(&state.config, content_type, provider.as_ref());
    credits::reserve(&state.db, caller.account_id, cost).await?;
    let mut guard = ReservationGuard::new(state.db.clone(), caller.account_id, cost);

    let callback_token = generate_callback_token();
    let job_id = match jobs::create(
        &state.db,
        caller.account_id,
        provider.name(),
        content_type,
        cost,
        &callback_token,
    )
    .await
    {
        Ok(id) => id,
        Err(e) => {
            // reserve succeeded but the job row never landed: compensate
            guard.release().await;
            return Err(e);
        }
    };

    if let Err(retry_after) = state.breaker.check(provider.name()) {
        fail_with_guard(&state.db, guard, job_id, caller.account_id, cost, "circuit_open").await?;
        return Err(ApiError::CircuitOpen {
            retry_after_secs: retry_after.as_secs() as i64,
        });
    }

    let callback_url = format!(
        "{}/webhooks/{}?token={}",
        state.config.public_url,
        provider.name(),
        callback_token
    );

    let timeout = Duration::from_secs(state.config.dispatch_timeout);
    let outcome = match tokio::time::timeout(timeout, provider.dispatch(&normalized, &callback_url))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(ProviderError::retryable("dispatch timed out")),
    };

    match outcome {
        Ok(Dispatch::Completed(artifact)) => {
            state.breaker.record(provider.name(), true);
            guard.disarm();
            // respond as soon as the provider call resolves; the supervised
            // continuation owns upload + terminal transition + refund-on-failure
            let task_state = state.clone();
            let account_id = caller.account_id;
            tokio::spawn(async move {
                finalize_sync(task_state, job_id, account_id, cost, artifact).await;
            });
            info!(%job_id, provider = provider.name(), "sync generation completed");
            Ok(GenerateResponse {
                job_id,
                status: JobState::Completed,
                credits_charged: cost,
            })
        }
        Ok(Dispatch::Accepted { task_id }) => {
            state.breaker.record(provider.name(), true);
            match jobs::mark_processing(&state.db, job_id, &task_id).await {
                Ok(_) => {
                    guard.disarm();
                    info!(%job_id, provider = provider.name(), %task_id, "async generation accepted");
                    Ok(GenerateResponse {
                        job_id,
                        status: JobState::Processing,
                        credits_charged: cost,
                    })
                }
                Err(e) => {
                    fail_with_guard(&state.db, guard, job_id, caller.account_id, cost, "internal")
                        .await
                        .ok();
                    Err(e)
                }
            }
        }
        Err(e) => {
            state.breaker.record(provider.name(), false);
            warn!(%job_id, provider = provider.name(), "dispatch failed: {e}");
            let code = if e.retryable {
                "provider_unavailable"
            } else {
                "provider_rejected"
            };
            fail_with_guard(&state.db, guard, job_id, caller.account_id, cost, code).await?;
            Err((&e).into())
        }
    }
}

/// Fail the job and settle the reservation. The guard stays armed until the
/// failure finalize (and its refund) has landed; if the finalize itself
/// errors, the explicit release refunds before the error propagates, so a
/// failed failure path never strands the deducted credits.
async fn fail_with_guard(
    db: &PgPool,
    mut guard: ReservationGuard,
    job_id: Uuid,
    account_id: Uuid,
    amount: f64,
    error_code: &str,
) -> Result<bool> {
    match finalize_failure(db, job_id, account_id, amount, error_code).await {
        Ok(applied) => {
            guard.disarm();
            Ok(applied)
        }
        Err(e) => {
            guard.release().await;
            Err(e)
        }
    }
}

/// Guarded failure: conditionally fail the job, and refund only when this
/// call actually won the terminal transition. Shared by the dispatcher, the
/// webhook handler, and the recovery scanner; this is the single place a
/// reservation turns into a refund.
pub async fn finalize_failure(
    db: &PgPool,
    job_id: Uuid,
    account_id: Uuid,
    amount: f64,
    error_code: &str,
) -> Result<bool> {
    let applied = jobs::fail(db, job_id, error_code).await?;
    if applied {
        credits::refund(db, account_id, amount).await?;
        info!(%job_id, error_code, "job failed, credits refunded");
    }
    Ok(applied)
}

/// Guarded success for async outputs: conditionally complete the job with the
/// provider-hosted URL, then mirror the artifact into our store in the
/// background. Only the caller that wins the transition mirrors, so a
/// duplicate delivery never re-runs the upload.
pub async fn finalize_success_from_url(
    state: &Arc<AppState>,
    job: &Job,
    provider_url: &str,
) -> Result<bool> {
    let applied = jobs::complete(&state.db, job.id, Some(provider_url)).await?;
    if applied {
        let task_state = state.clone();
        let job_id = job.id;
        let url = provider_url.to_string();
        tokio::spawn(async move {
            mirror_artifact(task_state, job_id, url).await;
        });
    }
    Ok(applied)
}

async fn mirror_artifact(state: Arc<AppState>, job_id: Uuid, provider_url: String) {
    let (bytes, content_type) = match state.storage.fetch_remote(&provider_url).await {
        Ok(fetched) => fetched,
        Err(_) => {
            warn!(%job_id, "artifact mirror fetch failed, keeping provider url");
            return;
        }
    };

    let key = storage::artifact_key(job_id, &content_type);
    match state.storage.upload(&key, bytes, &content_type).await {
        Ok(url) => {
            if let Err(e) = jobs::set_mirrored_output(&state.db, job_id, &url).await {
                warn!(%job_id, "failed to record mirrored output: {e}");
            }
        }
        Err(_) => warn!(%job_id, "artifact mirror upload failed, keeping provider url"),
    }
}

/// Continuation for synchronous completions: upload the inline artifact, then
/// apply the guarded transition. Upload failure takes the same
/// fail-plus-refund path as a dispatch failure.
async fn finalize_sync(
    state: Arc<AppState>,
    job_id: Uuid,
    account_id: Uuid,
    amount: f64,
    artifact: SyncArtifact,
) {
    let key = storage::artifact_key(job_id, &artifact.mime);
    match state
        .storage
        .upload(&key, artifact.bytes, &artifact.mime)
        .await
    {
        Ok(url) => match jobs::complete(&state.db, job_id, Some(&url)).await {
            Ok(true) => info!(%job_id, "artifact stored, job completed"),
            Ok(false) => warn!(%job_id, "job already terminal before artifact store"),
            Err(e) => error!(%job_id, "completion write failed: {e}"),
        },
        Err(_) => {
            error!(%job_id, "artifact upload failed, failing job");
            if let Err(e) =
                finalize_failure(&state.db, job_id, account_id, amount, "artifact_upload_failed")
                    .await
            {
                error!(%job_id, "failure finalize after upload error failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::deepinfra::DeepInfra;
    use crate::services::providers::replicate::Replicate;
    use clap::Parser;

    fn config() -> Config {
        Config::parse_from(["mediaforge"])
    }

    #[test]
    fn cost_applies_provider_multiplier() {
        let config = config();
        let di = DeepInfra::new(reqwest::Client::new(), "http://x".into(), None);
        let rep = Replicate::new(reqwest::Client::new(), "http://x".into(), None, None);

        assert_eq!(job_cost(&config, ContentType::Image, &di), 0.5);
        assert_eq!(job_cost(&config, ContentType::Image, &rep), 0.75);
        assert_eq!(job_cost(&config, ContentType::Video, &rep), 3.0);
    }

    #[test]
    fn callback_tokens_are_long_and_unique() {
        let a = generate_callback_token();
        let b = generate_callback_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
