//! Durable webhook work-queue rows. Ingestion inserts; the claim RPC hands
//! out leases; these helpers cover the remaining row transitions and the
//! reconciler's batch selects.

use chrono::{DateTime, Utc};
use formsandbox_contracts::WebhookEventStatus;
use sqlx::Row;

use crate::{Store, StoreError};

/// Stored errors are truncated so a pathological upstream message cannot
/// bloat the row.
pub const MAX_STORED_ERROR_LEN: usize = 1000;

impl Store {
    /// Inserts a fresh event row in `pending`. Returns `false` when the
    /// event id was already delivered (unique index on `event_id`).
    pub async fn insert_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.timed(async {
            let result = sqlx::query(
                "INSERT INTO stripe_webhook_events (event_id, event_type, payload, status, attempts, created_at) VALUES ($1, $2, $3, $4, 0, now()) ON CONFLICT (event_id) DO NOTHING",
            )
            .bind(event_id)
            .bind(event_type)
            .bind(payload)
            .bind(WebhookEventStatus::Pending.as_str())
            .execute(self.service_pool())
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    /// Terminal success: clears the claim fields so the row is never
    /// reselected.
    pub async fn mark_webhook_event_completed(&self, event_id: &str) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "UPDATE stripe_webhook_events SET status = $2, processed_at = now(), processor_id = NULL, processing_started_at = NULL, claim_expires_at = NULL, last_error = NULL WHERE event_id = $1",
            )
            .bind(event_id)
            .bind(WebhookEventStatus::Completed.as_str())
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    /// Failure: releases the claim and schedules the next attempt. The
    /// stored error is truncated to [`MAX_STORED_ERROR_LEN`].
    pub async fn mark_webhook_event_failed(
        &self,
        event_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let stored: String = error.chars().take(MAX_STORED_ERROR_LEN).collect();
        self.timed(async {
            sqlx::query(
                "UPDATE stripe_webhook_events SET status = $4, processor_id = NULL, processing_started_at = NULL, claim_expires_at = NULL, last_error = $2, next_attempt_at = $3 WHERE event_id = $1",
            )
            .bind(event_id)
            .bind(&stored)
            .bind(next_attempt_at)
            .bind(WebhookEventStatus::Failed.as_str())
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    /// Batch for the due-retry pass: pending/failed rows whose
    /// `next_attempt_at` has elapsed, plus processing rows whose lease
    /// expired, oldest first. The claim RPC re-validates each row, so this
    /// may over-approximate safely.
    pub async fn due_webhook_event_ids(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT event_id FROM stripe_webhook_events WHERE attempts < $1 AND ( (status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= now())) OR (status = 'failed' AND next_attempt_at <= now()) OR (status = 'processing' AND claim_expires_at < now()) ) ORDER BY created_at ASC LIMIT $2",
            )
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(self.service_pool())
            .await?;

            let mut ids = Vec::with_capacity(rows.len());
            for row in rows {
                ids.push(row.try_get("event_id")?);
            }
            Ok(ids)
        })
        .await
    }

    /// Retention pass: drops completed rows processed before the cutoff.
    pub async fn purge_completed_webhook_events(
        &self,
        processed_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.timed(async {
            let result = sqlx::query(
                "DELETE FROM stripe_webhook_events WHERE status = 'completed' AND processed_at < $1",
            )
            .bind(processed_before)
            .execute(self.service_pool())
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
