//! Shared domain vocabulary for the formsandbox gateway: plan catalog
//! identifiers, subscription and queue state enums, entitlement rows, and
//! canonical-JSON hashing.

use serde::{Deserialize, Serialize};

pub mod canonical;

/// Self-serve plan identifiers accepted on the checkout surface. `Free` and
/// `Enterprise` are valid slugs but are rejected by checkout with their own
/// error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanSlug {
    Free,
    Pro,
    Business,
    Enterprise,
}

impl PlanSlug {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanSlug::Free => "free",
            PlanSlug::Pro => "pro",
            PlanSlug::Business => "business",
            PlanSlug::Enterprise => "enterprise",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(PlanSlug::Free),
            "pro" => Some(PlanSlug::Pro),
            "business" => Some(PlanSlug::Business),
            "enterprise" => Some(PlanSlug::Enterprise),
            _ => None,
        }
    }

    /// Plans that may be purchased through self-serve checkout.
    pub fn is_self_serve(&self) -> bool {
        matches!(self, PlanSlug::Pro | PlanSlug::Business)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "monthly" => Some(BillingInterval::Monthly),
            "yearly" => Some(BillingInterval::Yearly),
            _ => None,
        }
    }

    /// Maps an upstream recurring interval (`month`/`year`) to the local
    /// naming. Other intervals (week, day) are not sold.
    pub fn from_upstream_interval(raw: &str) -> Option<Self> {
        match raw {
            "month" => Some(BillingInterval::Monthly),
            "year" => Some(BillingInterval::Yearly),
            _ => None,
        }
    }
}

/// Internal subscription status vocabulary. Upstream statuses are folded in
/// through [`SubscriptionStatus::from_upstream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "paused" => Some(SubscriptionStatus::Paused),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Folds the upstream status vocabulary into the internal one. Unknown
    /// upstream statuses land on `past_due` so the workspace keeps its
    /// entitlement until reconciliation settles the row.
    pub fn from_upstream(raw: &str) -> Self {
        match raw {
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "unpaid" => SubscriptionStatus::Unpaid,
            "paused" => SubscriptionStatus::Paused,
            "incomplete" => SubscriptionStatus::PastDue,
            "incomplete_expired" | "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::PastDue,
        }
    }

    /// Statuses that grant paid capability.
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }

    /// Terminal statuses after which the workspace must converge back to the
    /// free tier.
    pub fn is_non_entitled_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::Unpaid | SubscriptionStatus::Paused
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Pending => "pending",
            WebhookEventStatus::Processing => "processing",
            WebhookEventStatus::Completed => "completed",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(WebhookEventStatus::Pending),
            "processing" => Some(WebhookEventStatus::Processing),
            "completed" => Some(WebhookEventStatus::Completed),
            "failed" => Some(WebhookEventStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    InProgress,
    Completed,
    Failed,
}

impl CheckoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::InProgress => "in_progress",
            CheckoutStatus::Completed => "completed",
            CheckoutStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in_progress" => Some(CheckoutStatus::InProgress),
            "completed" => Some(CheckoutStatus::Completed),
            "failed" => Some(CheckoutStatus::Failed),
            _ => None,
        }
    }
}

/// Audit row types for the billing-customer mapping lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCustomerEventType {
    Validated,
    Invalidated,
    Recreated,
    WebhookDeleted,
}

impl BillingCustomerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCustomerEventType::Validated => "validated",
            BillingCustomerEventType::Invalidated => "invalidated",
            BillingCustomerEventType::Recreated => "recreated",
            BillingCustomerEventType::WebhookDeleted => "webhook_deleted",
        }
    }
}

/// One workspace entitlement as returned by `get_workspace_entitlements`.
/// `limit_value` of -1 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub feature_key: String,
    pub is_enabled: bool,
    pub limit_value: i64,
}
