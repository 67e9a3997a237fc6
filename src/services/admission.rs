//! Admission control: per-account hourly and concurrency caps by tier.
//!
//! Advisory only. Counts run against current rows with no transaction; a
//! false negative just means a brief overshoot, never a ledger violation.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::Caller;
use crate::error::{ApiError, Result};
use crate::services::jobs;

pub async fn check(db: &PgPool, caller: &Caller, retry_of: Option<Uuid>) -> Result<()> {
    if caller.is_admin {
        return Ok(());
    }

    let hourly_cap = caller.tier.hourly_cap();
    let recent = jobs::count_created_last_hour(db, caller.account_id).await?;
    if recent >= hourly_cap {
        let oldest = jobs::oldest_in_window(db, caller.account_id).await?;
        return Err(ApiError::RateLimited {
            limit: hourly_cap,
            current: recent,
            retry_after_secs: oldest.map(|o| hourly_retry_after(o, Utc::now())),
        });
    }

    let concurrent_cap = caller.tier.concurrent_cap();
    let active = jobs::count_active(db, caller.account_id, retry_of).await?;
    if active >= concurrent_cap {
        return Err(ApiError::RateLimited {
            limit: concurrent_cap,
            current: active,
            retry_after_secs: None,
        });
    }

    Ok(())
}

/// Seconds until the oldest job in the trailing window ages out.
fn hourly_retry_after(oldest: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let expires = oldest + Duration::hours(1);
    (expires - now).num_seconds().max(1)
}
