//! Durable event store with atomic claim semantics.
//!
//! Every inbound provider event gets a row before any processing happens,
//! including events whose signature later fails verification. The primary
//! key on `stripe_event_id` is the concurrency guard: concurrent deliveries
//! of the same event race on one INSERT and exactly one wins the claim.

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::ReconcileResult;

/// Rows stuck in `processing` longer than this are considered abandoned
/// (process crashed mid-flight) and may be reclaimed.
const STUCK_CLAIM_MINUTES: i64 = 10;

pub const RESULT_PROCESSING: &str = "processing";
pub const RESULT_SUCCEEDED: &str = "succeeded";

/// Insert-or-reclaim. The update branch also refreshes the stored payload
/// and type: a row first written from a delivery that failed verification
/// may hold a forged body, and the genuine redelivery that wins the
/// re-claim must replace it before processing.
const CLAIM_SQL: &str = r#"
    INSERT INTO processed_events
        (stripe_event_id, event_type, raw_payload, processing_result, processing_started_at)
    VALUES ($1, $2, $3, 'processing', NOW())
    ON CONFLICT (stripe_event_id) DO UPDATE
        SET processing_result = 'processing',
            processing_started_at = NOW(),
            raw_payload = EXCLUDED.raw_payload,
            event_type = EXCLUDED.event_type,
            error_message = NULL
        WHERE processed_events.processing_result NOT IN ('succeeded', 'processing')
           OR (processed_events.processing_result = 'processing'
               AND processed_events.processing_started_at < NOW() - ($4 || ' minutes')::interval)
    RETURNING stripe_event_id
"#;

/// Outcome of attempting to claim an event for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This delivery won the claim and must process the event.
    Claimed,
    /// The event was already handled (or is actively being handled);
    /// carries the stored processing result.
    Duplicate { prior_result: String },
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub stripe_event_id: String,
    pub event_type: String,
    pub received_at: OffsetDateTime,
    pub raw_payload: serde_json::Value,
    pub processing_result: String,
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record the event and atomically claim it for processing.
    ///
    /// The claim also succeeds for events whose previous attempt failed
    /// terminally (redelivery retries them) and for claims abandoned longer
    /// than the stuck window. Succeeded events and fresh in-flight claims
    /// report `Duplicate`.
    pub async fn record_and_claim(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: &serde_json::Value,
    ) -> ReconcileResult<ClaimOutcome> {
        let claimed: Option<(String,)> = sqlx::query_as(CLAIM_SQL)
            .bind(event_id)
            .bind(event_type)
            .bind(raw_payload)
            .bind(STUCK_CLAIM_MINUTES.to_string())
            .fetch_optional(&self.pool)
            .await?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let (prior_result,): (String,) = sqlx::query_as(
            "SELECT processing_result FROM processed_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(event_id, prior_result, "duplicate event delivery skipped");
        Ok(ClaimOutcome::Duplicate { prior_result })
    }

    pub async fn mark_succeeded(&self, event_id: &str) -> ReconcileResult<()> {
        sqlx::query(
            "UPDATE processed_events SET processing_result = 'succeeded', error_message = NULL
             WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a terminal or escalated failure. `kind` is the machine tag
    /// from the error taxonomy; the row keeps the human message too.
    pub async fn mark_failed(
        &self,
        event_id: &str,
        kind: &str,
        message: &str,
    ) -> ReconcileResult<()> {
        sqlx::query(
            "UPDATE processed_events SET processing_result = $2, error_message = $3
             WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .bind(format!("failed:{kind}"))
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Events whose last attempt failed, oldest first. Replay tooling works
    /// from this list.
    pub async fn list_failed(&self, limit: i64) -> ReconcileResult<Vec<StoredEvent>> {
        let events = sqlx::query_as::<_, StoredEvent>(
            "SELECT stripe_event_id, event_type, received_at, raw_payload,
                    processing_result, error_message
             FROM processed_events
             WHERE processing_result LIKE 'failed:%'
             ORDER BY received_at ASC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn get(&self, event_id: &str) -> ReconcileResult<Option<StoredEvent>> {
        let event = sqlx::query_as::<_, StoredEvent>(
            "SELECT stripe_event_id, event_type, received_at, raw_payload,
                    processing_result, error_message
             FROM processed_events
             WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    /// Flip abandoned in-flight claims back to a failed state so the replay
    /// path picks them up. Returns how many rows were reset.
    pub async fn reset_stuck(&self) -> ReconcileResult<u64> {
        let result = sqlx::query(
            "UPDATE processed_events
             SET processing_result = 'failed:stuck',
                 error_message = 'claim abandoned, reset by sweeper'
             WHERE processing_result = 'processing'
               AND processing_started_at < NOW() - ($1 || ' minutes')::interval",
        )
        .bind(STUCK_CLAIM_MINUTES.to_string())
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::warn!(count, "reset stuck event claims");
        }
        Ok(count)
    }
}

/// Best-effort event key for payloads that fail verification or parsing.
///
/// The audit invariant requires a stored row for every delivery, even ones
/// we reject; a forged payload may not contain a usable id, so fall back to
/// a digest of the body.
pub fn event_key_from_raw(body: &str) -> (String, String, serde_json::Value) {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => {
            let id = value
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| digest_key(body));
            let event_type = value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            (id, event_type, value)
        }
        Err(_) => (
            digest_key(body),
            "unparsable".to_string(),
            serde_json::json!({ "raw": body }),
        ),
    }
}

fn digest_key(body: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(body.as_bytes());
    format!("raw_{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_prefers_provider_id() {
        let body = r#"{"id":"evt_123","type":"checkout.session.completed","data":{}}"#;
        let (id, event_type, payload) = event_key_from_raw(body);
        assert_eq!(id, "evt_123");
        assert_eq!(event_type, "checkout.session.completed");
        assert_eq!(payload["id"], "evt_123");
    }

    #[test]
    fn event_key_falls_back_to_digest_when_id_missing() {
        let (id, event_type, _) = event_key_from_raw(r#"{"type":"x"}"#);
        assert!(id.starts_with("raw_"));
        assert_eq!(id.len(), "raw_".len() + 32);
        assert_eq!(event_type, "x");
    }

    #[test]
    fn event_key_handles_unparsable_body() {
        let (id, event_type, payload) = event_key_from_raw("not json at all");
        assert!(id.starts_with("raw_"));
        assert_eq!(event_type, "unparsable");
        assert_eq!(payload["raw"], "not json at all");
    }

    #[test]
    fn reclaim_replaces_stored_payload_and_type() {
        // The first row for an event id may have been written from a
        // delivery that failed verification; the winning re-claim must not
        // keep that body around under a later `succeeded` result.
        assert!(CLAIM_SQL.contains("raw_payload = EXCLUDED.raw_payload"));
        assert!(CLAIM_SQL.contains("event_type = EXCLUDED.event_type"));
    }

    #[test]
    fn digest_key_is_stable() {
        assert_eq!(digest_key("same body"), digest_key("same body"));
        assert_ne!(digest_key("body a"), digest_key("body b"));
    }
}
