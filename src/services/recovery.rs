//! Recovery scanner: drives jobs whose webhook never arrived to a terminal
//! state. Read-only over the ledger; every refund happens inside the shared
//! guarded finalize helpers, so re-scanning a job before it resolves is safe.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::services::providers::{Provider, TaskStatus};
use crate::services::{dispatch, jobs};
use crate::AppState;

#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub scanned: u64,
    pub recovered: u64,
    pub still_processing: u64,
    pub failed: u64,
    pub skipped_unrecoverable: u64,
    pub errors: u64,
}

/// One sweep over stuck processing jobs, oldest first, bounded batch.
/// Per-job errors are counted and logged, never propagated; a bad job must
/// not shadow the rest of the batch.
pub async fn run_scan(state: &Arc<AppState>) -> Result<ScanReport> {
    let mut report = ScanReport::default();

    let stuck = jobs::stuck_processing(
        &state.db,
        state.config.recovery_grace_secs,
        state.config.recovery_batch_size,
    )
    .await?;

    for job in stuck {
        report.scanned += 1;

        let Some(provider) = state.providers.get(&job.provider) else {
            warn!(job_id = %job.id, provider = %job.provider, "stuck job references unknown provider");
            report.errors += 1;
            continue;
        };

        if !provider.can_check_status() {
            // no status endpoint means unrecoverable by design
            report.skipped_unrecoverable += 1;
            continue;
        }

        let Some(task_id) = job.provider_task_id.as_deref() else {
            report.errors += 1;
            continue;
        };

        let timeout = Duration::from_secs(state.config.dispatch_timeout);
        let status = match tokio::time::timeout(timeout, provider.check_status(task_id)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(job_id = %job.id, provider = %job.provider, "status check failed: {e}");
                report.errors += 1;
                continue;
            }
            Err(_) => {
                warn!(job_id = %job.id, provider = %job.provider, "status check timed out");
                report.errors += 1;
                continue;
            }
        };

        match status {
            TaskStatus::Processing => report.still_processing += 1,
            TaskStatus::Succeeded { output_url } => {
                match dispatch::finalize_success_from_url(state, &job, &output_url).await {
                    Ok(applied) => {
                        if applied {
                            info!(job_id = %job.id, "recovered stuck job as completed");
                        }
                        report.recovered += 1;
                    }
                    Err(e) => {
                        warn!(job_id = %job.id, "recovery completion failed: {e}");
                        report.errors += 1;
                    }
                }
            }
            TaskStatus::Failed { reason } => {
                warn!(job_id = %job.id, provider = %job.provider, "provider reports failure: {reason}");
                match dispatch::finalize_failure(
                    &state.db,
                    job.id,
                    job.account_id,
                    job.credits_reserved,
                    "provider_failed",
                )
                .await
                {
                    Ok(_) => report.failed += 1,
                    Err(e) => {
                        warn!(job_id = %job.id, "recovery failure finalize failed: {e}");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    Ok(report)
}
