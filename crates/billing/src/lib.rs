//! Billing integration: durable checkout idempotency, customer-mapping
//! self-healing, the webhook claim/process loop, scheduled reconciliation,
//! and catalog sync. All coordination is via the database — this crate owns
//! no in-process durable state.

use formsandbox_store::{Store, StoreError};
use formsandbox_stripe::{StripeClient, StripeError};
use ulid::Ulid;

pub mod catalog;
pub mod checkout;
pub mod customer;
pub mod processor;
pub mod reconciler;
pub mod worker;

pub use catalog::CatalogSyncReport;
pub use checkout::{CheckoutError, CheckoutOutcome, PortalError};
pub use processor::ProcessOutcome;
pub use reconciler::TickReport;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub grace_days: i64,
    pub webhook_claim_ttl_seconds: i64,
    pub webhook_max_attempts: i32,
    pub retry_batch_size: i64,
    pub grace_batch_size: i64,
    pub catalog_sync_enabled: bool,
    pub catalog_sync_cron: String,
    pub catalog_env: Option<String>,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub portal_return_url: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            grace_days: 7,
            webhook_claim_ttl_seconds: 300,
            webhook_max_attempts: 8,
            retry_batch_size: 200,
            grace_batch_size: 500,
            catalog_sync_enabled: true,
            catalog_sync_cron: "*/15 * * * *".to_string(),
            catalog_env: None,
            checkout_success_url: String::new(),
            checkout_cancel_url: String::new(),
            portal_return_url: String::new(),
        }
    }
}

#[derive(Debug)]
pub enum BillingError {
    Store(StoreError),
    Stripe(StripeError),
    /// No local plan variant matches the upstream price, even after a
    /// forced catalog sync.
    CatalogOutOfSync,
    /// The event payload did not carry enough to resolve a workspace.
    WorkspaceResolution(String),
    /// The event payload could not be decoded into the expected shape.
    Payload(String),
}

impl std::fmt::Display for BillingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BillingError::Store(err) => write!(f, "store error: {}", err),
            BillingError::Stripe(err) => write!(f, "stripe error: {}", err),
            BillingError::CatalogOutOfSync => write!(f, "catalog out of sync"),
            BillingError::WorkspaceResolution(detail) => {
                write!(f, "workspace resolution failed: {}", detail)
            }
            BillingError::Payload(detail) => write!(f, "payload error: {}", detail),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<StoreError> for BillingError {
    fn from(value: StoreError) -> Self {
        BillingError::Store(value)
    }
}

impl From<StripeError> for BillingError {
    fn from(value: StripeError) -> Self {
        BillingError::Stripe(value)
    }
}

/// Shared handle over the store and the upstream client. Cloning is cheap;
/// the webhook worker and the request handlers hold the same instance.
#[derive(Clone)]
pub struct BillingService {
    store: Store,
    stripe: StripeClient,
    config: BillingConfig,
    processor_id: String,
}

impl BillingService {
    pub fn new(store: Store, stripe: StripeClient, config: BillingConfig) -> Self {
        let processor_id = format!("gw-{}", Ulid::new());
        Self {
            store,
            stripe,
            config,
            processor_id,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn processor_id(&self) -> &str {
        &self.processor_id
    }
}
