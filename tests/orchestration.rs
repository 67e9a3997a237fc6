//! Ledger and state-machine invariants against a live postgres.
//! Run with: DATABASE_URL=postgres://... cargo test --features db-tests

#![cfg(feature = "db-tests")]

use mediaforge::error::ApiError;
use mediaforge::models::ContentType;
use mediaforge::services::{credits, dispatch, jobs};
use sqlx::PgPool;
use uuid::Uuid;

async fn seed_account(pool: &PgPool, balance: f64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO accounts (id) VALUES ($1)")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
    credits::grant(pool, id, balance, "seed").await.unwrap();
    id
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_reserves_never_oversubscribe(pool: PgPool) {
    let account = seed_account(&pool, 5.0).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(
            async move { credits::reserve(&pool, account, 1.0).await },
        ));
    }

    let mut succeeded = 0u32;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => succeeded += 1,
            Err(ApiError::InsufficientCredits { .. }) | Err(ApiError::ConcurrentUpdate) => {}
            Err(other) => panic!("unexpected reserve error: {other}"),
        }
    }

    // every successful reserve debited exactly once and the balance never
    // went negative, regardless of how the races interleaved
    assert!(succeeded <= 5);
    let balance = credits::balance(&pool, account).await.unwrap();
    assert_eq!(balance, 5.0 - f64::from(succeeded));
}

#[sqlx::test(migrations = "./migrations")]
async fn reserve_rejects_insufficient_balance(pool: PgPool) {
    let account = seed_account(&pool, 1.0).await;

    match credits::reserve(&pool, account, 2.0).await {
        Err(ApiError::InsufficientCredits {
            required,
            available,
        }) => {
            assert_eq!(required, 2.0);
            assert_eq!(available, 1.0);
        }
        other => panic!("expected insufficient credits, got {other:?}"),
    }
    assert_eq!(credits::balance(&pool, account).await.unwrap(), 1.0);
}

#[sqlx::test(migrations = "./migrations")]
async fn terminal_job_is_immutable(pool: PgPool) {
    let account = seed_account(&pool, 5.0).await;
    credits::reserve(&pool, account, 2.0).await.unwrap();
    let job_id = jobs::create(&pool, account, "replicate", ContentType::Image, 2.0, "tok")
        .await
        .unwrap();
    assert!(jobs::mark_processing(&pool, job_id, "task-1").await.unwrap());

    assert!(jobs::complete(&pool, job_id, Some("https://cdn/x.png"))
        .await
        .unwrap());

    // a late failure report loses the transition and must not refund
    let applied = dispatch::finalize_failure(&pool, job_id, account, 2.0, "provider_failed")
        .await
        .unwrap();
    assert!(!applied);
    assert_eq!(credits::balance(&pool, account).await.unwrap(), 3.0);

    let job = jobs::fetch(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "completed");
    assert_eq!(job.output_url.as_deref(), Some("https://cdn/x.png"));
}

#[sqlx::test(migrations = "./migrations")]
async fn duplicate_failure_refunds_once(pool: PgPool) {
    let account = seed_account(&pool, 5.0).await;
    credits::reserve(&pool, account, 2.0).await.unwrap();
    let job_id = jobs::create(&pool, account, "replicate", ContentType::Image, 2.0, "tok")
        .await
        .unwrap();
    assert!(jobs::mark_processing(&pool, job_id, "task-2").await.unwrap());

    let first = dispatch::finalize_failure(&pool, job_id, account, 2.0, "provider_failed")
        .await
        .unwrap();
    let second = dispatch::finalize_failure(&pool, job_id, account, 2.0, "provider_failed")
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(credits::balance(&pool, account).await.unwrap(), 5.0);
}
