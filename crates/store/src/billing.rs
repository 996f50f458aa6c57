//! Billing rows: checkout idempotency ledger, workspace↔customer mappings
//! with their audit trail, subscriptions, plan variants, and the
//! denormalized workspace plan cache.

use chrono::{DateTime, Utc};
use formsandbox_contracts::BillingCustomerEventType;
use sqlx::Row;
use uuid::Uuid;

use crate::{Store, StoreError};

/// Checkout idempotency rows expire this long after creation.
pub const CHECKOUT_IDEMPOTENCY_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckoutIdempotencyRow {
    pub workspace_id: Uuid,
    pub client_key: Uuid,
    pub plan_variant_id: Uuid,
    pub request_fingerprint: String,
    pub upstream_idempotency_key: String,
    pub upstream_session_id: Option<String>,
    pub upstream_session_url: Option<String>,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub plan_id: Uuid,
    pub plan_variant_id: Option<Uuid>,
    pub status: String,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Field set written by the subscription sync upsert.
#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub workspace_id: Uuid,
    pub plan_id: Uuid,
    pub plan_variant_id: Option<Uuid>,
    pub status: String,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanVariantRow {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub plan_slug: String,
    pub interval: String,
    pub currency: String,
    pub active: bool,
    pub stripe_price_id: Option<String>,
    pub amount_cents: i64,
    pub trial_period_days: Option<i32>,
}

const SUBSCRIPTION_COLUMNS: &str = "id, workspace_id, plan_id, plan_variant_id, status, stripe_subscription_id, stripe_customer_id, current_period_start, current_period_end, trial_start, trial_end, cancel_at_period_end, canceled_at, ended_at, grace_period_end, metadata";

const VARIANT_COLUMNS: &str = "pv.id, pv.plan_id, p.slug AS plan_slug, pv.\"interval\", pv.currency, pv.active, pv.stripe_price_id, pv.amount_cents, pv.trial_period_days";

impl Store {
    // ------------------------------------------------------------------
    // Checkout idempotency ledger
    // ------------------------------------------------------------------

    /// First-writer insert of an `in_progress` row. Returns `false` on the
    /// unique `(workspace_id, client_key)` conflict; the caller then reloads
    /// the surviving row and applies the replay rules.
    pub async fn insert_checkout_in_progress(
        &self,
        workspace_id: Uuid,
        client_key: Uuid,
        plan_variant_id: Uuid,
        request_fingerprint: &str,
        upstream_idempotency_key: &str,
    ) -> Result<bool, StoreError> {
        self.timed(async {
            let result = sqlx::query(
                "INSERT INTO checkout_idempotency (workspace_id, client_key, plan_variant_id, request_fingerprint, upstream_idempotency_key, status, expires_at, created_at) VALUES ($1, $2, $3, $4, $5, 'in_progress', now() + make_interval(hours => $6), now()) ON CONFLICT (workspace_id, client_key) DO NOTHING",
            )
            .bind(workspace_id)
            .bind(client_key)
            .bind(plan_variant_id)
            .bind(request_fingerprint)
            .bind(upstream_idempotency_key)
            .bind(CHECKOUT_IDEMPOTENCY_TTL_HOURS as i32)
            .execute(self.service_pool())
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    pub async fn get_checkout_row(
        &self,
        workspace_id: Uuid,
        client_key: Uuid,
    ) -> Result<Option<CheckoutIdempotencyRow>, StoreError> {
        self.timed(async {
            let row = sqlx::query_as::<_, CheckoutIdempotencyRow>(
                "SELECT workspace_id, client_key, plan_variant_id, request_fingerprint, upstream_idempotency_key, upstream_session_id, upstream_session_url, status, expires_at, last_error FROM checkout_idempotency WHERE workspace_id = $1 AND client_key = $2",
            )
            .bind(workspace_id)
            .bind(client_key)
            .fetch_optional(self.service_pool())
            .await?;
            Ok(row)
        })
        .await
    }

    pub async fn complete_checkout(
        &self,
        workspace_id: Uuid,
        client_key: Uuid,
        session_id: &str,
        session_url: &str,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "UPDATE checkout_idempotency SET status = 'completed', upstream_session_id = $3, upstream_session_url = $4, last_error = NULL WHERE workspace_id = $1 AND client_key = $2",
            )
            .bind(workspace_id)
            .bind(client_key)
            .bind(session_id)
            .bind(session_url)
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn fail_checkout(
        &self,
        workspace_id: Uuid,
        client_key: Uuid,
        last_error: &str,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "UPDATE checkout_idempotency SET status = 'failed', last_error = $3 WHERE workspace_id = $1 AND client_key = $2",
            )
            .bind(workspace_id)
            .bind(client_key)
            .bind(last_error)
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Billing-customer mapping + audit
    // ------------------------------------------------------------------

    pub async fn billing_customer_for_workspace(
        &self,
        workspace_id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT stripe_customer_id FROM workspace_billing_customers WHERE workspace_id = $1",
            )
            .bind(workspace_id)
            .fetch_optional(self.service_pool())
            .await?;
            Ok(match row {
                Some(row) => Some(row.try_get("stripe_customer_id")?),
                None => None,
            })
        })
        .await
    }

    pub async fn upsert_billing_customer(
        &self,
        workspace_id: Uuid,
        customer_id: &str,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO workspace_billing_customers (workspace_id, stripe_customer_id, created_at) VALUES ($1, $2, now()) ON CONFLICT (workspace_id) DO UPDATE SET stripe_customer_id = EXCLUDED.stripe_customer_id",
            )
            .bind(workspace_id)
            .bind(customer_id)
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn delete_billing_customer(&self, workspace_id: Uuid) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("DELETE FROM workspace_billing_customers WHERE workspace_id = $1")
                .bind(workspace_id)
                .execute(self.service_pool())
                .await?;
            Ok(())
        })
        .await
    }

    /// Removes every mapping pointing at an upstream customer id (used on
    /// `customer.deleted`). Returns the affected workspaces.
    pub async fn delete_billing_customers_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        self.timed(async {
            let rows = sqlx::query(
                "DELETE FROM workspace_billing_customers WHERE stripe_customer_id = $1 RETURNING workspace_id",
            )
            .bind(customer_id)
            .fetch_all(self.service_pool())
            .await?;

            let mut workspaces = Vec::with_capacity(rows.len());
            for row in rows {
                workspaces.push(row.try_get("workspace_id")?);
            }
            Ok(workspaces)
        })
        .await
    }

    pub async fn workspace_for_billing_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT workspace_id FROM workspace_billing_customers WHERE stripe_customer_id = $1",
            )
            .bind(customer_id)
            .fetch_optional(self.service_pool())
            .await?;
            Ok(match row {
                Some(row) => Some(row.try_get("workspace_id")?),
                None => None,
            })
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_billing_customer_event(
        &self,
        workspace_id: Uuid,
        event_type: BillingCustomerEventType,
        old_customer_id: Option<&str>,
        new_customer_id: Option<&str>,
        reason: &str,
        stripe_event_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO billing_customer_events (workspace_id, event_type, old_customer_id, new_customer_id, reason, stripe_event_id, created_at) VALUES ($1, $2, $3, $4, $5, $6, now())",
            )
            .bind(workspace_id)
            .bind(event_type.as_str())
            .bind(old_customer_id)
            .bind(new_customer_id)
            .bind(reason)
            .bind(stripe_event_id)
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub async fn subscription_by_upstream_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<SubscriptionRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE stripe_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        self.timed(async {
            let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(stripe_subscription_id)
                .fetch_optional(self.service_pool())
                .await?;
            Ok(row)
        })
        .await
    }

    pub async fn latest_subscription_by_customer(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Option<SubscriptionRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE stripe_customer_id = $1 ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        self.timed(async {
            let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(stripe_customer_id)
                .fetch_optional(self.service_pool())
                .await?;
            Ok(row)
        })
        .await
    }

    /// Latest entitled row for a workspace (`active`/`trialing`/`past_due`).
    pub async fn latest_entitled_subscription(
        &self,
        workspace_id: Uuid,
    ) -> Result<Option<SubscriptionRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE workspace_id = $1 AND status IN ('active', 'trialing', 'past_due') ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        self.timed(async {
            let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(workspace_id)
                .fetch_optional(self.service_pool())
                .await?;
            Ok(row)
        })
        .await
    }

    pub async fn update_subscription_row(
        &self,
        id: Uuid,
        write: &SubscriptionWrite,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "UPDATE subscriptions SET workspace_id = $2, plan_id = $3, plan_variant_id = $4, status = $5, stripe_subscription_id = $6, stripe_customer_id = $7, current_period_start = $8, current_period_end = $9, trial_start = $10, trial_end = $11, cancel_at_period_end = $12, canceled_at = $13, ended_at = $14, metadata = $15, updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(write.workspace_id)
            .bind(write.plan_id)
            .bind(write.plan_variant_id)
            .bind(&write.status)
            .bind(&write.stripe_subscription_id)
            .bind(&write.stripe_customer_id)
            .bind(write.current_period_start)
            .bind(write.current_period_end)
            .bind(write.trial_start)
            .bind(write.trial_end)
            .bind(write.cancel_at_period_end)
            .bind(write.canceled_at)
            .bind(write.ended_at)
            .bind(&write.metadata)
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn insert_subscription_row(
        &self,
        write: &SubscriptionWrite,
    ) -> Result<Uuid, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                "INSERT INTO subscriptions (workspace_id, plan_id, plan_variant_id, status, stripe_subscription_id, stripe_customer_id, current_period_start, current_period_end, trial_start, trial_end, cancel_at_period_end, canceled_at, ended_at, metadata, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(), now()) RETURNING id",
            )
            .bind(write.workspace_id)
            .bind(write.plan_id)
            .bind(write.plan_variant_id)
            .bind(&write.status)
            .bind(&write.stripe_subscription_id)
            .bind(&write.stripe_customer_id)
            .bind(write.current_period_start)
            .bind(write.current_period_end)
            .bind(write.trial_start)
            .bind(write.trial_end)
            .bind(write.cancel_at_period_end)
            .bind(write.canceled_at)
            .bind(write.ended_at)
            .bind(&write.metadata)
            .fetch_one(self.service_pool())
            .await?;
            Ok(row.try_get("id")?)
        })
        .await
    }

    /// Sets or clears the grace deadline for the named upstream
    /// subscription without touching its status. Returns whether a row
    /// matched.
    pub async fn set_subscription_grace_period(
        &self,
        stripe_subscription_id: &str,
        grace_period_end: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE subscriptions SET grace_period_end = $2, updated_at = now() WHERE stripe_subscription_id = $1",
            )
            .bind(stripe_subscription_id)
            .bind(grace_period_end)
            .execute(self.service_pool())
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Cancels every upstream-linked row of a workspace (used when the
    /// upstream customer disappears).
    pub async fn cancel_upstream_subscriptions_for_workspace(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE subscriptions SET status = 'canceled', canceled_at = $2, ended_at = $2, updated_at = now() WHERE workspace_id = $1 AND stripe_subscription_id IS NOT NULL AND status <> 'canceled'",
            )
            .bind(workspace_id)
            .bind(now)
            .execute(self.service_pool())
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// `past_due` rows whose grace deadline elapsed, oldest deadline first.
    pub async fn expired_grace_subscriptions(
        &self,
        limit: i64,
    ) -> Result<Vec<SubscriptionRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE status = 'past_due' AND grace_period_end IS NOT NULL AND grace_period_end <= now() ORDER BY grace_period_end ASC LIMIT $1",
            SUBSCRIPTION_COLUMNS
        );
        self.timed(async {
            let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
                .bind(limit)
                .fetch_all(self.service_pool())
                .await?;
            Ok(rows)
        })
        .await
    }

    pub async fn cancel_subscription_row(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "UPDATE subscriptions SET status = 'canceled', canceled_at = $2, ended_at = $2, grace_period_end = NULL, updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(now)
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    // ------------------------------------------------------------------
    // Plan variants + plan cache
    // ------------------------------------------------------------------

    pub async fn variant_by_id(&self, id: Uuid) -> Result<Option<PlanVariantRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM plan_variants pv JOIN plans p ON p.id = pv.plan_id WHERE pv.id = $1",
            VARIANT_COLUMNS
        );
        self.timed(async {
            let row = sqlx::query_as::<_, PlanVariantRow>(&sql)
                .bind(id)
                .fetch_optional(self.service_pool())
                .await?;
            Ok(row)
        })
        .await
    }

    pub async fn active_variant_by_price(
        &self,
        stripe_price_id: &str,
    ) -> Result<Option<PlanVariantRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM plan_variants pv JOIN plans p ON p.id = pv.plan_id WHERE pv.stripe_price_id = $1 AND pv.active",
            VARIANT_COLUMNS
        );
        self.timed(async {
            let row = sqlx::query_as::<_, PlanVariantRow>(&sql)
                .bind(stripe_price_id)
                .fetch_optional(self.service_pool())
                .await?;
            Ok(row)
        })
        .await
    }

    pub async fn active_variant_for_plan(
        &self,
        plan_slug: &str,
        interval: &str,
        currency: &str,
    ) -> Result<Option<PlanVariantRow>, StoreError> {
        let sql = format!(
            "SELECT {} FROM plan_variants pv JOIN plans p ON p.id = pv.plan_id WHERE p.slug = $1 AND pv.\"interval\" = $2 AND pv.currency = $3 AND pv.active",
            VARIANT_COLUMNS
        );
        self.timed(async {
            let row = sqlx::query_as::<_, PlanVariantRow>(&sql)
                .bind(plan_slug)
                .bind(interval)
                .bind(currency)
                .fetch_optional(self.service_pool())
                .await?;
            Ok(row)
        })
        .await
    }

    pub async fn update_variant_pricing(
        &self,
        id: Uuid,
        stripe_price_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                "UPDATE plan_variants SET stripe_price_id = $2, amount_cents = $3, currency = $4, updated_at = now() WHERE id = $1",
            )
            .bind(id)
            .bind(stripe_price_id)
            .bind(amount_cents)
            .bind(currency)
            .execute(self.service_pool())
            .await?;
            Ok(())
        })
        .await
    }

    /// Recomputes the denormalized workspace plan cache from the latest
    /// entitled subscription and returns the written slug.
    pub async fn refresh_workspace_plan(&self, workspace_id: Uuid) -> Result<String, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT p.slug FROM subscriptions s JOIN plans p ON p.id = s.plan_id WHERE s.workspace_id = $1 AND s.status IN ('active', 'trialing', 'past_due') ORDER BY s.created_at DESC LIMIT 1",
            )
            .bind(workspace_id)
            .fetch_optional(self.service_pool())
            .await?;

            let slug: String = match row {
                Some(row) => row.try_get("slug")?,
                None => "free".to_string(),
            };

            sqlx::query("UPDATE workspaces SET plan = $2, updated_at = now() WHERE id = $1")
                .bind(workspace_id)
                .bind(&slug)
                .execute(self.service_pool())
                .await?;

            Ok(slug)
        })
        .await
    }
}
