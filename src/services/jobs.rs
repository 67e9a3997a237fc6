//! Job store: persisted generation records and their state machine.
//!
//! Terminal transitions are conditional updates keyed on the current status.
//! A finalize attempt that finds the job already terminal affects zero rows
//! and the caller treats it as a no-op, which is what makes duplicate webhook
//! deliveries and racing recovery scans safe.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ContentType, Job};

const JOB_COLUMNS: &str = "id, account_id, provider, content_type, status, provider_task_id, \
     credits_reserved, callback_token, output_url, error_code, created_at, finalized_at";

pub async fn create(
    db: &PgPool,
    account_id: Uuid,
    provider: &str,
    content_type: ContentType,
    credits_reserved: f64,
    callback_token: &str,
) -> Result<Uuid> {
    let job_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO jobs (id, account_id, provider, content_type, status, credits_reserved, callback_token)
        VALUES ($1, $2, $3, $4, 'pending', $5, $6)
        "#,
    )
    .bind(job_id)
    .bind(account_id)
    .bind(provider)
    .bind(content_type.as_str())
    .bind(credits_reserved)
    .bind(callback_token)
    .execute(db)
    .await?;

    Ok(job_id)
}

pub async fn fetch(db: &PgPool, job_id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(db)
    .await?;
    Ok(job)
}

pub async fn find_by_task(db: &PgPool, provider: &str, task_id: &str) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE provider = $1 AND provider_task_id = $2"
    ))
    .bind(provider)
    .bind(task_id)
    .fetch_optional(db)
    .await?;
    Ok(job)
}

/// pending -> processing, recording the provider's task handle.
pub async fn mark_processing(db: &PgPool, job_id: Uuid, task_id: &str) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'processing', provider_task_id = $2
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(job_id)
    .bind(task_id)
    .execute(db)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Guarded terminal transition to completed. Returns whether this caller won
/// the transition; a false return means the job was already terminal.
pub async fn complete(db: &PgPool, job_id: Uuid, output_url: Option<&str>) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'completed', output_url = $2, finalized_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'processing')
        "#,
    )
    .bind(job_id)
    .bind(output_url)
    .execute(db)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Guarded terminal transition to failed. The caller refunds iff this
/// returns true, which is what keeps refunds at-most-once.
pub async fn fail(db: &PgPool, job_id: Uuid, error_code: &str) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', error_code = $2, finalized_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'processing')
        "#,
    )
    .bind(job_id)
    .bind(error_code)
    .execute(db)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Replace the recorded output reference after the artifact has been mirrored
/// into our store. Keyed on completed so it never resurrects a failed job.
pub async fn set_mirrored_output(db: &PgPool, job_id: Uuid, url: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET output_url = $2 WHERE id = $1 AND status = 'completed'")
        .bind(job_id)
        .bind(url)
        .execute(db)
        .await?;
    Ok(())
}

/// Jobs stuck in processing past the grace period, oldest first.
pub async fn stuck_processing(db: &PgPool, grace_secs: i64, batch: i64) -> Result<Vec<Job>> {
    let cutoff = Utc::now() - Duration::seconds(grace_secs);

    let jobs = sqlx::query_as::<_, Job>(&format!(
        r#"
        SELECT {JOB_COLUMNS} FROM jobs
        WHERE status = 'processing'
          AND provider_task_id IS NOT NULL
          AND created_at < $1
        ORDER BY created_at ASC
        LIMIT $2
        "#
    ))
    .bind(cutoff)
    .bind(batch)
    .fetch_all(db)
    .await?;
    Ok(jobs)
}

pub async fn count_created_last_hour(db: &PgPool, account_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE account_id = $1 AND created_at > NOW() - INTERVAL '1 hour'",
    )
    .bind(account_id)
    .fetch_one(db)
    .await?;
    Ok(count)
}

pub async fn count_active(db: &PgPool, account_id: Uuid, exclude: Option<Uuid>) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM jobs
        WHERE account_id = $1
          AND status IN ('pending', 'processing')
          AND ($2::uuid IS NULL OR id <> $2)
        "#,
    )
    .bind(account_id)
    .bind(exclude)
    .fetch_one(db)
    .await?;
    Ok(count)
}

pub async fn oldest_in_window(
    db: &PgPool,
    account_id: Uuid,
) -> Result<Option<chrono::DateTime<Utc>>> {
    let oldest: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
        "SELECT MIN(created_at) FROM jobs WHERE account_id = $1 AND created_at > NOW() - INTERVAL '1 hour'",
    )
    .bind(account_id)
    .fetch_one(db)
    .await?;
    Ok(oldest)
}
