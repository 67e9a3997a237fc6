//! Credit ledger: optimistic-lock reserve, atomic refund.
//!
//! Correctness across replicas lives entirely in the store: `reserve` is a
//! read-compare-write on the balance column and `refund` is a single additive
//! increment. No in-process locks, no row locks held across job creation.

use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ApiError, Result};

const CAS_ATTEMPTS: u32 = 3;

pub async fn balance(db: &PgPool, account_id: Uuid) -> Result<f64> {
    let balance: Option<f64> =
        sqlx::query_scalar("SELECT balance FROM account_credits WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(db)
            .await?;
    Ok(balance.unwrap_or(0.0))
}

/// Reserve `amount` credits against the account's balance.
///
/// The update only applies if the stored balance still equals the value just
/// read; zero rows affected means a concurrent writer won the race and we
/// re-read. After `CAS_ATTEMPTS` lost races the caller gets
/// `ConcurrentUpdate` and may retry the whole submission.
pub async fn reserve(db: &PgPool, account_id: Uuid, amount: f64) -> Result<()> {
    for attempt in 0..CAS_ATTEMPTS {
        let current = balance(db, account_id).await?;

        if current < amount {
            return Err(ApiError::InsufficientCredits {
                required: amount,
                available: current,
            });
        }

        let rows = sqlx::query(
            r#"
            UPDATE account_credits
            SET balance = balance - $1, updated_at = NOW()
            WHERE account_id = $2 AND balance = $3
            "#,
        )
        .bind(amount)
        .bind(account_id)
        .bind(current)
        .execute(db)
        .await?
        .rows_affected();

        if rows == 1 {
            log_transaction(db, account_id, -amount, "reserve", None).await;
            return Ok(());
        }

        warn!(%account_id, attempt, "balance CAS lost race, retrying");
    }

    Err(ApiError::ConcurrentUpdate)
}

/// Return previously reserved credits. Unconditional additive increment, so
/// concurrent reserves/refunds never clobber each other; at-most-once is the
/// caller's job (the guarded terminal transition on the owning job).
pub async fn refund(db: &PgPool, account_id: Uuid, amount: f64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE account_credits
        SET balance = balance + $1, updated_at = NOW()
        WHERE account_id = $2
        "#,
    )
    .bind(amount)
    .bind(account_id)
    .execute(db)
    .await?;

    log_transaction(db, account_id, amount, "refund", None).await;
    Ok(())
}

pub async fn grant(db: &PgPool, account_id: Uuid, amount: f64, description: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO account_credits (account_id, balance)
        VALUES ($1, $2)
        ON CONFLICT (account_id) DO UPDATE
        SET balance = account_credits.balance + $2, updated_at = NOW()
        "#,
    )
    .bind(account_id)
    .bind(amount)
    .execute(db)
    .await?;

    log_transaction(db, account_id, amount, "grant", Some(description)).await;
    Ok(())
}

// Audit trail only; a failed insert must not fail the ledger movement itself.
async fn log_transaction(
    db: &PgPool,
    account_id: Uuid,
    amount: f64,
    kind: &str,
    description: Option<&str>,
) {
    let result = sqlx::query(
        r#"
        INSERT INTO credit_transactions (id, account_id, amount, kind, description)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(account_id)
    .bind(amount)
    .bind(kind)
    .bind(description)
    .execute(db)
    .await;

    if let Err(e) = result {
        warn!(%account_id, kind, "failed to log credit transaction: {e}");
    }
}
