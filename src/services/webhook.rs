//! Webhook ingestion: signature + freshness verification, a per-job token as
//! a second verification layer, and an insert-only dedup ledger for
//! at-least-once delivery.
//!
//! The dedup check and the job transition are deliberately not one
//! transaction; the guarded conditional status update is what stops two
//! near-simultaneous deliveries from double-applying.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::Result;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `t=<unix>,v1=<hex hmac>` signature header over `"{t}.{payload}"`
/// and reject signed timestamps outside the freshness window.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &str,
    now_unix: i64,
    tolerance_secs: i64,
) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(ts)) => timestamp = ts.parse().ok(),
            (Some("v1"), Some(sig)) => signatures.push(sig.to_string()),
            _ => {}
        }
    }

    let Some(ts) = timestamp else {
        return false;
    };

    // replay window: stale or far-future timestamps fail even with a valid mac
    if (now_unix - ts).abs() > tolerance_secs {
        return false;
    }

    let expected = compute_signature(secret, ts, payload);
    signatures
        .iter()
        .any(|sig| constant_time_eq(sig.as_bytes(), expected.as_bytes()))
}

pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> String {
    let signed_payload = format!("{}.{}", timestamp, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(signed_payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Dedup key for a delivery: provider event id, else the task id, else the
/// delivery id, in that preference order.
pub fn idempotency_key(
    event_id: Option<&str>,
    task_id: Option<&str>,
    delivery_id: Option<&str>,
) -> Option<String> {
    event_id
        .or(task_id)
        .or(delivery_id)
        .filter(|k| !k.is_empty())
        .map(|k| k.to_string())
}

pub async fn already_processed(db: &PgPool, key: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM webhook_events WHERE idempotency_key = $1)")
            .bind(key)
            .fetch_one(db)
            .await?;
    Ok(exists)
}

pub async fn record_event(db: &PgPool, key: &str, job_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO webhook_events (idempotency_key, job_id)
        VALUES ($1, $2)
        ON CONFLICT (idempotency_key) DO NOTHING
        "#,
    )
    .bind(key)
    .bind(job_id)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn header_for(payload: &str, ts: i64) -> String {
        format!("t={},v1={}", ts, compute_signature(SECRET, ts, payload))
    }

    #[test]
    fn valid_signature_within_window() {
        let payload = r#"{"id":"p1","status":"succeeded"}"#;
        let now = 1_700_000_000;
        let header = header_for(payload, now - 10);
        assert!(verify_signature(SECRET, &header, payload, now, 300));
    }

    #[test]
    fn tampered_payload_rejected() {
        let now = 1_700_000_000;
        let header = header_for(r#"{"id":"p1"}"#, now);
        assert!(!verify_signature(SECRET, &header, r#"{"id":"p2"}"#, now, 300));
    }

    #[test]
    fn wrong_secret_rejected() {
        let payload = "body";
        let now = 1_700_000_000;
        let header = header_for(payload, now);
        assert!(!verify_signature("other-secret", &header, payload, now, 300));
    }

    #[test]
    fn stale_timestamp_rejected_even_with_valid_mac() {
        let payload = "body";
        let now = 1_700_000_000;
        let header = header_for(payload, now - 301);
        assert!(!verify_signature(SECRET, &header, payload, now, 300));
        // future-dated replays fail too
        let header = header_for(payload, now + 301);
        assert!(!verify_signature(SECRET, &header, payload, now, 300));
    }

    #[test]
    fn malformed_header_rejected() {
        assert!(!verify_signature(SECRET, "", "body", 0, 300));
        assert!(!verify_signature(SECRET, "v1=deadbeef", "body", 0, 300));
        assert!(!verify_signature(SECRET, "t=notanumber,v1=x", "body", 0, 300));
    }

    #[test]
    fn idempotency_key_preference_order() {
        assert_eq!(
            idempotency_key(Some("evt"), Some("task"), Some("dlv")).unwrap(),
            "evt"
        );
        assert_eq!(
            idempotency_key(None, Some("task"), Some("dlv")).unwrap(),
            "task"
        );
        assert_eq!(idempotency_key(None, None, Some("dlv")).unwrap(), "dlv");
        assert!(idempotency_key(None, None, None).is_none());
        assert!(idempotency_key(Some(""), None, None).is_none());
    }

    #[test]
    fn token_compare_is_length_safe() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
