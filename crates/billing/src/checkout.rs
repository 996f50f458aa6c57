//! Checkout orchestration over the durable idempotency ledger (C5).
//!
//! Per `(workspace, client_key)` the ledger row moves
//! `in_progress → completed | failed`; replays are answered from the row
//! under the fingerprint/expiry rules, and the first-insert race is settled
//! by the unique index, not by in-process locks.

use chrono::Utc;
use formsandbox_contracts::canonical::{hash_canonical_json, sha256_hex};
use formsandbox_contracts::{BillingInterval, CheckoutStatus, PlanSlug};
use formsandbox_store::billing::PlanVariantRow;
use formsandbox_store::StoreError;
use formsandbox_stripe::CreateCheckoutSessionParams;
use uuid::Uuid;

use crate::{BillingError, BillingService};

const UPSTREAM_KEY_MAX_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
    pub url: String,
    pub session_id: String,
    pub destination: &'static str,
    pub reason: Option<String>,
    pub idempotent_replay: bool,
}

#[derive(Debug)]
pub enum CheckoutError {
    /// Same key replayed with a different logical payload.
    KeyReusedWithDifferentPayload,
    /// The ledger row expired (24 h) before the replay arrived.
    KeyExpired,
    /// Another request currently holds the row `in_progress`.
    InProgress,
    /// No active plan variant matches the requested plan, even after a
    /// forced catalog sync.
    CatalogOutOfSync,
    Billing(BillingError),
}

impl std::fmt::Display for CheckoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckoutError::KeyReusedWithDifferentPayload => {
                write!(f, "idempotency key reused with different payload")
            }
            CheckoutError::KeyExpired => write!(f, "idempotency key expired"),
            CheckoutError::InProgress => write!(f, "checkout already in progress"),
            CheckoutError::CatalogOutOfSync => write!(f, "catalog out of sync"),
            CheckoutError::Billing(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CheckoutError {}

impl From<BillingError> for CheckoutError {
    fn from(value: BillingError) -> Self {
        CheckoutError::Billing(value)
    }
}

impl From<StoreError> for CheckoutError {
    fn from(value: StoreError) -> Self {
        CheckoutError::Billing(BillingError::Store(value))
    }
}

#[derive(Debug)]
pub struct PortalError(pub BillingError);

impl std::fmt::Display for PortalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PortalError {}

/// Deterministic hash of the logical checkout payload, used to distinguish
/// "same request" from "different request" under a reused client key.
pub fn request_fingerprint(
    workspace_id: Uuid,
    plan_variant_id: Uuid,
    requested_by_user_id: Option<Uuid>,
) -> String {
    let payload = serde_json::json!({
        "workspace_id": workspace_id.to_string(),
        "plan_variant_id": plan_variant_id.to_string(),
        "requested_by_user_id": requested_by_user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "anonymous".to_string()),
    });
    hash_canonical_json(&payload)
}

/// Upstream idempotency key for session creation. Collapsed through SHA-256
/// when it would exceed the provider's 255-char limit.
pub fn upstream_idempotency_key(
    workspace_id: Uuid,
    plan_variant_id: Uuid,
    client_key: Uuid,
) -> String {
    let key = format!(
        "checkout:v1:{}:{}:{}",
        workspace_id, plan_variant_id, client_key
    );
    if key.len() > UPSTREAM_KEY_MAX_LEN {
        return format!("checkout:v1:{}", sha256_hex(key.as_bytes()));
    }
    key
}

fn destination_for_session(session_id: &str) -> &'static str {
    if session_id.starts_with("bps_") {
        "portal"
    } else {
        "checkout"
    }
}

impl BillingService {
    /// Creates (or replays) a checkout for `plan`/`interval`. Workspaces
    /// that already hold an upstream-linked entitled subscription are routed
    /// to the billing portal instead of a second checkout.
    pub async fn start_checkout(
        &self,
        workspace_id: Uuid,
        requested_by: Option<Uuid>,
        plan: PlanSlug,
        interval: BillingInterval,
        client_key: Uuid,
        correlation_id: &str,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let variant = self.resolve_variant(plan, interval).await?;
        let fingerprint = request_fingerprint(workspace_id, variant.id, requested_by);
        let upstream_key = upstream_idempotency_key(workspace_id, variant.id, client_key);

        let inserted = self
            .store()
            .insert_checkout_in_progress(
                workspace_id,
                client_key,
                variant.id,
                &fingerprint,
                &upstream_key,
            )
            .await?;

        if !inserted {
            let Some(row) = self.store().get_checkout_row(workspace_id, client_key).await? else {
                return Err(BillingError::WorkspaceResolution(
                    "idempotency row vanished after conflict".to_string(),
                )
                .into());
            };

            if row.expires_at <= Utc::now() {
                return Err(CheckoutError::KeyExpired);
            }
            if row.request_fingerprint != fingerprint {
                return Err(CheckoutError::KeyReusedWithDifferentPayload);
            }

            match CheckoutStatus::parse(&row.status) {
                Some(CheckoutStatus::Completed) => {
                    if let (Some(session_id), Some(url)) =
                        (row.upstream_session_id, row.upstream_session_url)
                    {
                        return Ok(CheckoutOutcome {
                            destination: destination_for_session(&session_id),
                            url,
                            session_id,
                            reason: None,
                            idempotent_replay: true,
                        });
                    }
                    // A completed row always holds a session; a row without
                    // one is still settling.
                    return Err(CheckoutError::InProgress);
                }
                Some(CheckoutStatus::InProgress) => return Err(CheckoutError::InProgress),
                // A failed attempt with the same payload may be retried on
                // the same row.
                Some(CheckoutStatus::Failed) | None => {}
            }
        }

        match self
            .create_session_for_checkout(workspace_id, &variant, &upstream_key, correlation_id)
            .await
        {
            Ok(outcome) => {
                self.store()
                    .complete_checkout(workspace_id, client_key, &outcome.session_id, &outcome.url)
                    .await?;
                Ok(outcome)
            }
            Err(err) => {
                let detail = err.to_string();
                self.store()
                    .fail_checkout(workspace_id, client_key, &detail)
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Billing-portal session for workspace self-management.
    pub async fn start_portal_session(
        &self,
        workspace_id: Uuid,
        correlation_id: &str,
    ) -> Result<String, PortalError> {
        let return_url = self.config().portal_return_url.clone();
        let stripe = self.stripe().clone();

        let session = self
            .with_recovered_customer(
                workspace_id,
                "portal",
                correlation_id,
                None,
                move |customer_id| {
                    let stripe = stripe.clone();
                    let return_url = return_url.clone();
                    async move { stripe.create_portal_session(&customer_id, &return_url).await }
                },
            )
            .await
            .map_err(PortalError)?;

        Ok(session.url)
    }

    async fn resolve_variant(
        &self,
        plan: PlanSlug,
        interval: BillingInterval,
    ) -> Result<PlanVariantRow, CheckoutError> {
        if let Some(variant) = self
            .store()
            .active_variant_for_plan(plan.as_str(), interval.as_str(), "usd")
            .await?
        {
            return Ok(variant);
        }

        // Unknown locally: the catalog may have drifted. One forced sync,
        // one re-lookup.
        self.sync_catalog().await.map_err(CheckoutError::Billing)?;

        self.store()
            .active_variant_for_plan(plan.as_str(), interval.as_str(), "usd")
            .await?
            .ok_or(CheckoutError::CatalogOutOfSync)
    }

    async fn create_session_for_checkout(
        &self,
        workspace_id: Uuid,
        variant: &PlanVariantRow,
        upstream_key: &str,
        correlation_id: &str,
    ) -> Result<CheckoutOutcome, BillingError> {
        let existing = self.store().latest_entitled_subscription(workspace_id).await?;
        let to_portal = existing
            .as_ref()
            .map(|row| row.stripe_subscription_id.is_some())
            .unwrap_or(false);

        if to_portal {
            let return_url = self.config().portal_return_url.clone();
            let stripe = self.stripe().clone();
            let session = self
                .with_recovered_customer(
                    workspace_id,
                    "checkout",
                    correlation_id,
                    None,
                    move |customer_id| {
                        let stripe = stripe.clone();
                        let return_url = return_url.clone();
                        async move { stripe.create_portal_session(&customer_id, &return_url).await }
                    },
                )
                .await?;

            // Portal sessions do not expose an id on this API version's
            // narrow decode; synthesize a stable one from the URL.
            let session_id = format!("bps_{}", &sha256_hex(session.url.as_bytes())[..24]);
            return Ok(CheckoutOutcome {
                url: session.url,
                session_id,
                destination: "portal",
                reason: Some("existing_subscription".to_string()),
                idempotent_replay: false,
            });
        }

        let success_url = self.config().checkout_success_url.clone();
        let cancel_url = self.config().checkout_cancel_url.clone();
        let price_id = variant
            .stripe_price_id
            .clone()
            .ok_or(BillingError::CatalogOutOfSync)?;
        let trial_period_days = variant.trial_period_days;
        let workspace = workspace_id.to_string();
        let upstream_key = upstream_key.to_string();
        let stripe = self.stripe().clone();

        let session = self
            .with_recovered_customer(
                workspace_id,
                "checkout",
                correlation_id,
                None,
                move |customer_id| {
                    let stripe = stripe.clone();
                    let params_price = price_id.clone();
                    let workspace = workspace.clone();
                    let success_url = success_url.clone();
                    let cancel_url = cancel_url.clone();
                    let upstream_key = upstream_key.clone();
                    async move {
                        stripe
                            .create_checkout_session(
                                &CreateCheckoutSessionParams {
                                    customer_id: &customer_id,
                                    price_id: &params_price,
                                    workspace_id: &workspace,
                                    success_url: &success_url,
                                    cancel_url: &cancel_url,
                                    trial_period_days,
                                },
                                &upstream_key,
                            )
                            .await
                    }
                },
            )
            .await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::Payload("checkout session without url".to_string()))?;

        Ok(CheckoutOutcome {
            url,
            session_id: session.id,
            destination: "checkout",
            reason: None,
            idempotent_replay: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn fingerprint_depends_on_workspace_variant_and_actor() {
        let base = request_fingerprint(uuid(1), uuid(2), Some(uuid(3)));
        assert_eq!(base, request_fingerprint(uuid(1), uuid(2), Some(uuid(3))));
        assert_ne!(base, request_fingerprint(uuid(9), uuid(2), Some(uuid(3))));
        assert_ne!(base, request_fingerprint(uuid(1), uuid(9), Some(uuid(3))));
        assert_ne!(base, request_fingerprint(uuid(1), uuid(2), Some(uuid(9))));
    }

    #[test]
    fn anonymous_actor_hashes_to_its_own_fingerprint() {
        let anon = request_fingerprint(uuid(1), uuid(2), None);
        let named = request_fingerprint(uuid(1), uuid(2), Some(uuid(3)));
        assert_ne!(anon, named);
        assert_eq!(anon, request_fingerprint(uuid(1), uuid(2), None));
    }

    #[test]
    fn upstream_key_stays_under_provider_limit() {
        let key = upstream_idempotency_key(uuid(1), uuid(2), uuid(3));
        assert!(key.starts_with("checkout:v1:"));
        assert!(key.len() <= UPSTREAM_KEY_MAX_LEN);
    }

    #[test]
    fn destination_is_derived_from_session_id_prefix() {
        assert_eq!(destination_for_session("cs_test_123"), "checkout");
        assert_eq!(destination_for_session("bps_live_456"), "portal");
    }
}
