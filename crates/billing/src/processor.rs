//! Webhook event processing (C8): claim the row through the lease RPC,
//! map the event onto subscription state, and settle the row as completed
//! or failed with exponential backoff.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use formsandbox_contracts::{BillingCustomerEventType, SubscriptionStatus};
use formsandbox_store::billing::SubscriptionWrite;
use formsandbox_stripe::types::{CheckoutSession, Customer, Event, Subscription};
use uuid::Uuid;

use crate::{BillingError, BillingService};

/// Retry backoff in seconds: `min(3600, 15·2^min(attempts, 10))`.
pub fn retry_backoff_seconds(attempts: i32) -> i64 {
    let exponent = attempts.clamp(0, 10) as u32;
    (15i64 << exponent).min(3600)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The claim RPC declined: already done, leased elsewhere, not due, or
    /// out of attempts.
    NotClaimed,
    Completed,
    /// Processing failed; the row was parked until `next_attempt_at`.
    Failed { attempts: i32, error: String },
}

impl BillingService {
    /// Claims and processes one event id end to end. Never returns an error
    /// for processing failures — those settle into the row — only for the
    /// bookkeeping writes themselves.
    pub async fn process_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<ProcessOutcome, BillingError> {
        let claimed = self
            .store()
            .claim_stripe_webhook_event(
                event_id,
                self.processor_id(),
                self.config().webhook_claim_ttl_seconds,
                self.config().webhook_max_attempts,
            )
            .await?;

        let Some(claimed) = claimed else {
            return Ok(ProcessOutcome::NotClaimed);
        };

        let result = match serde_json::from_value::<Event>(claimed.payload.clone()) {
            Ok(event) => self.apply_event(&event).await,
            Err(err) => Err(BillingError::Payload(format!(
                "undecodable event envelope: {}",
                err
            ))),
        };

        match result {
            Ok(()) => {
                self.store().mark_webhook_event_completed(event_id).await?;
                tracing::info!(
                    event_id = %event_id,
                    event_type = %claimed.event_type,
                    attempt = claimed.attempts,
                    "billing.webhook_completed"
                );
                Ok(ProcessOutcome::Completed)
            }
            Err(err) => {
                let detail = err.to_string();
                let next_attempt_at =
                    Utc::now() + ChronoDuration::seconds(retry_backoff_seconds(claimed.attempts));
                self.store()
                    .mark_webhook_event_failed(event_id, &detail, next_attempt_at)
                    .await?;
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %claimed.event_type,
                    attempt = claimed.attempts,
                    error = %detail,
                    "billing.webhook_failed"
                );
                Ok(ProcessOutcome::Failed {
                    attempts: claimed.attempts,
                    error: detail,
                })
            }
        }
    }

    async fn apply_event(&self, event: &Event) -> Result<(), BillingError> {
        match event.event_type.as_str() {
            "checkout.session.completed" => self.on_checkout_completed(event).await,
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => {
                let subscription: Subscription =
                    serde_json::from_value(event.data.object.clone()).map_err(|err| {
                        BillingError::Payload(format!("undecodable subscription: {}", err))
                    })?;
                self.sync_subscription(&subscription, None, Some(&event.id))
                    .await
            }
            "customer.deleted" => self.on_customer_deleted(event).await,
            "invoice.payment_failed" => self.on_invoice_payment_failed(event).await,
            "invoice.paid" => self.on_invoice_paid(event).await,
            // Events outside the handled set complete as no-ops so the row
            // does not churn through retries.
            _ => Ok(()),
        }
    }

    async fn on_checkout_completed(&self, event: &Event) -> Result<(), BillingError> {
        let session: CheckoutSession = serde_json::from_value(event.data.object.clone())
            .map_err(|err| BillingError::Payload(format!("undecodable session: {}", err)))?;

        if session.mode.as_deref() != Some("subscription") {
            return Ok(());
        }
        let Some(subscription_id) = session.subscription.as_deref() else {
            return Ok(());
        };

        let workspace_hint = event
            .data
            .object
            .get("metadata")
            .and_then(|m| m.get("workspace_id"))
            .and_then(|v| v.as_str())
            .or_else(|| {
                event
                    .data
                    .object
                    .get("client_reference_id")
                    .and_then(|v| v.as_str())
            })
            .and_then(|raw| Uuid::parse_str(raw).ok());

        let subscription = self.stripe().retrieve_subscription(subscription_id).await?;
        self.sync_subscription(&subscription, workspace_hint, Some(&event.id))
            .await
    }

    async fn on_customer_deleted(&self, event: &Event) -> Result<(), BillingError> {
        let customer: Customer = serde_json::from_value(event.data.object.clone())
            .map_err(|err| BillingError::Payload(format!("undecodable customer: {}", err)))?;

        let workspaces = self
            .store()
            .delete_billing_customers_by_customer_id(&customer.id)
            .await?;

        let now = Utc::now();
        for workspace_id in workspaces {
            self.store()
                .cancel_upstream_subscriptions_for_workspace(workspace_id, now)
                .await?;
            self.store()
                .ensure_free_subscription_for_workspace(workspace_id, "customer_deleted")
                .await?;
            self.store().refresh_workspace_plan(workspace_id).await?;
            self.store()
                .record_billing_customer_event(
                    workspace_id,
                    BillingCustomerEventType::WebhookDeleted,
                    Some(&customer.id),
                    None,
                    "customer.deleted webhook",
                    Some(&event.id),
                )
                .await?;
        }

        Ok(())
    }

    /// Payment failure opens (or extends) the grace window. Status is never
    /// touched from invoice events; downgrade happens only when the window
    /// elapses.
    async fn on_invoice_payment_failed(&self, event: &Event) -> Result<(), BillingError> {
        let Some(subscription_id) = invoice_subscription_id(&event.data.object) else {
            return Ok(());
        };

        let grace_end = Utc::now() + ChronoDuration::days(self.config().grace_days);
        let matched = self
            .store()
            .set_subscription_grace_period(&subscription_id, Some(grace_end))
            .await?;

        if !matched {
            // The subscription row may simply not have arrived yet; retrying
            // lets event ordering heal.
            return Err(BillingError::WorkspaceResolution(format!(
                "no local subscription for {}",
                subscription_id
            )));
        }
        Ok(())
    }

    async fn on_invoice_paid(&self, event: &Event) -> Result<(), BillingError> {
        let Some(subscription_id) = invoice_subscription_id(&event.data.object) else {
            return Ok(());
        };
        // Clearing grace on an unknown row is a no-op by construction.
        self.store()
            .set_subscription_grace_period(&subscription_id, None)
            .await?;
        Ok(())
    }

    /// Upserts local subscription state from the upstream object.
    pub async fn sync_subscription(
        &self,
        subscription: &Subscription,
        workspace_hint: Option<Uuid>,
        stripe_event_id: Option<&str>,
    ) -> Result<(), BillingError> {
        let existing = self
            .store()
            .subscription_by_upstream_id(&subscription.id)
            .await?;

        // Resolution order: explicit hint → metadata → existing row by
        // upstream id → customer mapping → any row by customer id.
        let workspace_id = match workspace_hint {
            Some(hint) => Some(hint),
            None => subscription
                .metadata
                .get("workspace_id")
                .and_then(|raw| Uuid::parse_str(raw).ok()),
        };
        let workspace_id = match workspace_id {
            Some(id) => id,
            None => match &existing {
                Some(row) => row.workspace_id,
                None => {
                    match self
                        .store()
                        .workspace_for_billing_customer(&subscription.customer)
                        .await?
                    {
                        Some(id) => id,
                        None => self
                            .store()
                            .latest_subscription_by_customer(&subscription.customer)
                            .await?
                            .map(|row| row.workspace_id)
                            .ok_or_else(|| {
                                BillingError::WorkspaceResolution(format!(
                                    "no workspace for subscription {} (customer {})",
                                    subscription.id, subscription.customer
                                ))
                            })?,
                    }
                }
            },
        };

        // Resolve the plan variant from the current price; one forced
        // catalog sync before giving up. An existing row keeps its variant
        // when the price is unknown locally.
        let price_id = subscription.current_price_id().map(str::to_string);
        let mut variant = match &price_id {
            Some(price_id) => self.store().active_variant_by_price(price_id).await?,
            None => None,
        };
        if variant.is_none() {
            if let Some(price_id) = &price_id {
                self.sync_catalog().await?;
                variant = self.store().active_variant_by_price(price_id).await?;
            }
        }

        let (plan_id, plan_variant_id) = match (&variant, &existing) {
            (Some(variant), _) => (variant.plan_id, Some(variant.id)),
            (None, Some(row)) => (row.plan_id, row.plan_variant_id),
            (None, None) => return Err(BillingError::CatalogOutOfSync),
        };

        let status = SubscriptionStatus::from_upstream(&subscription.status);
        let write = SubscriptionWrite {
            workspace_id,
            plan_id,
            plan_variant_id,
            status: status.as_str().to_string(),
            stripe_subscription_id: subscription.id.clone(),
            stripe_customer_id: Some(subscription.customer.clone()),
            current_period_start: epoch_ts(subscription.current_period_start),
            current_period_end: epoch_ts(subscription.current_period_end),
            trial_start: epoch_ts(subscription.trial_start),
            trial_end: epoch_ts(subscription.trial_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: epoch_ts(subscription.canceled_at),
            ended_at: epoch_ts(subscription.ended_at),
            metadata: serde_json::to_value(&subscription.metadata)
                .unwrap_or_else(|_| serde_json::json!({})),
        };

        match existing {
            Some(row) => {
                self.store().update_subscription_row(row.id, &write).await?;
            }
            None if status.is_entitled() => {
                // Adopt the latest entitled row (typically the free row the
                // workspace started on) rather than stacking a second
                // entitled subscription.
                match self.store().latest_entitled_subscription(workspace_id).await? {
                    Some(row) => {
                        self.store().update_subscription_row(row.id, &write).await?;
                    }
                    None => {
                        self.store().insert_subscription_row(&write).await?;
                    }
                }
            }
            None => {
                self.store().insert_subscription_row(&write).await?;
            }
        }

        if status.is_non_entitled_terminal() {
            self.store()
                .ensure_free_subscription_for_workspace(workspace_id, "subscription_sync")
                .await?;
        }

        let plan = self.store().refresh_workspace_plan(workspace_id).await?;
        tracing::info!(
            workspace_id = %workspace_id,
            subscription_id = %subscription.id,
            status = %status.as_str(),
            plan = %plan,
            stripe_event_id = stripe_event_id.unwrap_or("-"),
            "billing.subscription_synced"
        );

        Ok(())
    }
}

fn invoice_subscription_id(object: &serde_json::Value) -> Option<String> {
    object
        .get("subscription")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn epoch_ts(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|secs| DateTime::from_timestamp(secs, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_one_hour() {
        assert_eq!(retry_backoff_seconds(0), 15);
        assert_eq!(retry_backoff_seconds(1), 30);
        assert_eq!(retry_backoff_seconds(2), 60);
        assert_eq!(retry_backoff_seconds(5), 480);
        assert_eq!(retry_backoff_seconds(8), 3600);
        assert_eq!(retry_backoff_seconds(10), 3600);
        // The exponent clamps, so absurd attempt counts stay at the cap.
        assert_eq!(retry_backoff_seconds(1000), 3600);
    }

    #[test]
    fn invoice_subscription_extraction_tolerates_null() {
        assert_eq!(
            invoice_subscription_id(&serde_json::json!({"subscription": "sub_1"})),
            Some("sub_1".to_string())
        );
        assert_eq!(invoice_subscription_id(&serde_json::json!({"subscription": null})), None);
        assert_eq!(invoice_subscription_id(&serde_json::json!({})), None);
    }

    #[test]
    fn epoch_conversion() {
        assert!(epoch_ts(None).is_none());
        let ts = epoch_ts(Some(1_700_000_000)).expect("valid epoch");
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }
}
