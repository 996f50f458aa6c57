//! Workspace↔billing-customer mapping recovery (C6).
//!
//! The mapping is advisory: the upstream provider is the source of truth
//! for customer existence. Every entry here validates the mapping before
//! use, invalidates it when the provider no longer knows the customer, and
//! recreates it inline with a deterministic operation-level idempotency key
//! so crashed retries cannot mint duplicate customers.

use std::future::Future;

use formsandbox_contracts::canonical::sha256_hex;
use formsandbox_contracts::BillingCustomerEventType;
use formsandbox_stripe::{CreateCustomerParams, StripeError};
use uuid::Uuid;

use crate::{BillingError, BillingService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Validated,
    Recreated,
}

#[derive(Debug, Clone)]
pub struct CustomerResolution {
    pub customer_id: String,
    pub status: ResolutionStatus,
}

/// Idempotency key for customer creation: `customer:v2:{workspace}:{scope_hash}`.
pub fn customer_idempotency_key(workspace_id: Uuid, scope: &str) -> String {
    format!(
        "customer:v2:{}:{}",
        workspace_id,
        sha256_hex(scope.as_bytes())
    )
}

impl BillingService {
    /// Validates the existing mapping (if any) against the provider, then
    /// creates and persists a fresh customer when the mapping is stale or
    /// absent.
    pub async fn resolve_or_create_customer(
        &self,
        workspace_id: Uuid,
        scope: &str,
    ) -> Result<CustomerResolution, BillingError> {
        if let Some(mapped) = self.store().billing_customer_for_workspace(workspace_id).await? {
            match self.stripe().retrieve_customer(&mapped).await {
                Ok(customer) if !customer.deleted => {
                    return Ok(CustomerResolution {
                        customer_id: mapped,
                        status: ResolutionStatus::Validated,
                    });
                }
                Ok(_) => {
                    self.invalidate_customer_mapping(
                        workspace_id,
                        &mapped,
                        "customer deleted upstream",
                        None,
                    )
                    .await?;
                }
                Err(err) if err.is_missing_customer(&mapped) => {
                    self.invalidate_customer_mapping(
                        workspace_id,
                        &mapped,
                        "resource_missing on retrieve",
                        None,
                    )
                    .await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let created = self
            .stripe()
            .create_customer(
                &CreateCustomerParams {
                    workspace_id: &workspace_id.to_string(),
                    name: None,
                    email: None,
                },
                &customer_idempotency_key(workspace_id, scope),
            )
            .await?;

        self.store()
            .upsert_billing_customer(workspace_id, &created.id)
            .await?;
        self.store()
            .record_billing_customer_event(
                workspace_id,
                BillingCustomerEventType::Recreated,
                None,
                Some(&created.id),
                scope,
                None,
            )
            .await?;

        Ok(CustomerResolution {
            customer_id: created.id,
            status: ResolutionStatus::Recreated,
        })
    }

    /// Runs `execute` against a customer id that is known-good at call time,
    /// recovering exactly once when the provider reports the id missing
    /// mid-operation. A second failure propagates to the caller.
    pub async fn with_recovered_customer<T, F, Fut>(
        &self,
        workspace_id: Uuid,
        scope: &str,
        correlation_id: &str,
        preferred: Option<String>,
        execute: F,
    ) -> Result<T, BillingError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, StripeError>>,
    {
        let customer_id = match preferred {
            Some(preferred_id) => match self.stripe().retrieve_customer(&preferred_id).await {
                Ok(customer) if !customer.deleted => {
                    self.store()
                        .upsert_billing_customer(workspace_id, &preferred_id)
                        .await?;
                    self.store()
                        .record_billing_customer_event(
                            workspace_id,
                            BillingCustomerEventType::Validated,
                            None,
                            Some(&preferred_id),
                            scope,
                            None,
                        )
                        .await?;
                    preferred_id
                }
                Ok(_) => {
                    self.invalidate_customer_mapping(
                        workspace_id,
                        &preferred_id,
                        "preferred customer deleted upstream",
                        None,
                    )
                    .await?;
                    self.resolve_or_create_customer(workspace_id, scope)
                        .await?
                        .customer_id
                }
                Err(err) if err.is_missing_customer(&preferred_id) => {
                    self.invalidate_customer_mapping(
                        workspace_id,
                        &preferred_id,
                        "preferred customer missing upstream",
                        None,
                    )
                    .await?;
                    self.resolve_or_create_customer(workspace_id, scope)
                        .await?
                        .customer_id
                }
                Err(err) => return Err(err.into()),
            },
            None => {
                self.resolve_or_create_customer(workspace_id, scope)
                    .await?
                    .customer_id
            }
        };

        match execute(customer_id.clone()).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_missing_customer(&customer_id) => {
                self.invalidate_customer_mapping(
                    workspace_id,
                    &customer_id,
                    "customer vanished during operation",
                    None,
                )
                .await?;

                let retry_scope = format!("{}:retry:{}", scope, correlation_id);
                let recovered = self
                    .resolve_or_create_customer(workspace_id, &retry_scope)
                    .await?;

                execute(recovered.customer_id).await.map_err(Into::into)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn invalidate_customer_mapping(
        &self,
        workspace_id: Uuid,
        customer_id: &str,
        reason: &str,
        stripe_event_id: Option<&str>,
    ) -> Result<(), BillingError> {
        self.store().delete_billing_customer(workspace_id).await?;
        self.store()
            .record_billing_customer_event(
                workspace_id,
                BillingCustomerEventType::Invalidated,
                Some(customer_id),
                None,
                reason,
                stripe_event_id,
            )
            .await?;
        Ok(())
    }
}
