//! Minimal Stripe API client for the billing surface: checkout and portal
//! sessions, customer lifecycle, subscription retrieval, and the recurring
//! price list used by catalog sync. Requests are form-encoded; responses
//! are decoded into the narrow shapes in [`types`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

pub mod signature;
pub mod types;

pub use signature::{verify_signature, SignatureError};
pub use types::{
    CheckoutSession, Customer, Event, ListPage, PortalSession, Price, Subscription,
};

const STRIPE_VERSION: &str = "2024-06-20";

#[derive(Debug, Clone, Deserialize)]
pub struct StripeApiError {
    #[serde(skip)]
    pub status: u16,
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug)]
pub enum StripeError {
    Timeout,
    Http(reqwest::Error),
    Api(StripeApiError),
    InvalidResponse,
}

impl std::fmt::Display for StripeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StripeError::Timeout => write!(f, "stripe request timed out"),
            StripeError::Http(err) => write!(f, "stripe http error: {}", err),
            StripeError::Api(err) => write!(
                f,
                "stripe api error ({} {}): {}",
                err.status, err.error_type, err.message
            ),
            StripeError::InvalidResponse => write!(f, "stripe returned an undecodable response"),
        }
    }
}

impl std::error::Error for StripeError {}

impl From<reqwest::Error> for StripeError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            StripeError::Timeout
        } else {
            StripeError::Http(value)
        }
    }
}

impl StripeError {
    /// Detects the "mapped customer no longer exists upstream" condition
    /// that triggers mapping recovery.
    pub fn is_missing_customer(&self, customer_id: &str) -> bool {
        let StripeError::Api(api) = self else {
            return false;
        };
        if api.error_type == "invalid_request_error"
            && api.code.as_deref() == Some("resource_missing")
            && api.param.as_deref() == Some("customer")
        {
            return true;
        }
        api.message.contains("No such customer") && api.message.contains(customer_id)
    }
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: StripeApiError,
}

#[derive(Debug, Clone)]
pub struct CreateCustomerParams<'a> {
    pub workspace_id: &'a str,
    pub name: Option<&'a str>,
    pub email: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct CreateCheckoutSessionParams<'a> {
    pub customer_id: &'a str,
    pub price_id: &'a str,
    pub workspace_id: &'a str,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
    pub trial_period_days: Option<i32>,
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(
        secret_key: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, StripeError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(StripeError::Http)?;

        Ok(Self {
            http,
            base_url,
            secret_key,
        })
    }

    pub async fn retrieve_customer(&self, customer_id: &str) -> Result<Customer, StripeError> {
        self.get(&format!("/v1/customers/{}", customer_id), &[]).await
    }

    /// Creates a customer with an operation-level idempotency key so a
    /// crashed retry cannot mint duplicates.
    pub async fn create_customer(
        &self,
        params: &CreateCustomerParams<'_>,
        idempotency_key: &str,
    ) -> Result<Customer, StripeError> {
        let mut form = vec![(
            "metadata[workspace_id]".to_string(),
            params.workspace_id.to_string(),
        )];
        if let Some(name) = params.name {
            form.push(("name".to_string(), name.to_string()));
        }
        if let Some(email) = params.email {
            form.push(("email".to_string(), email.to_string()));
        }
        self.post_form("/v1/customers", &form, Some(idempotency_key))
            .await
    }

    pub async fn create_checkout_session(
        &self,
        params: &CreateCheckoutSessionParams<'_>,
        idempotency_key: &str,
    ) -> Result<CheckoutSession, StripeError> {
        let mut form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("customer".to_string(), params.customer_id.to_string()),
            ("line_items[0][price]".to_string(), params.price_id.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), params.success_url.to_string()),
            ("cancel_url".to_string(), params.cancel_url.to_string()),
            (
                "client_reference_id".to_string(),
                params.workspace_id.to_string(),
            ),
            (
                "metadata[workspace_id]".to_string(),
                params.workspace_id.to_string(),
            ),
            (
                "subscription_data[metadata][workspace_id]".to_string(),
                params.workspace_id.to_string(),
            ),
        ];
        if let Some(days) = params.trial_period_days {
            form.push((
                "subscription_data[trial_period_days]".to_string(),
                days.to_string(),
            ));
        }
        self.post_form("/v1/checkout/sessions", &form, Some(idempotency_key))
            .await
    }

    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession, StripeError> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];
        self.post_form("/v1/billing_portal/sessions", &form, None)
            .await
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, StripeError> {
        self.get(&format!("/v1/subscriptions/{}", subscription_id), &[])
            .await
    }

    /// Lists every active recurring price, following pagination.
    pub async fn list_active_recurring_prices(&self) -> Result<Vec<Price>, StripeError> {
        let mut prices = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            let mut query = vec![
                ("active", "true".to_string()),
                ("type", "recurring".to_string()),
                ("limit", "100".to_string()),
            ];
            if let Some(cursor) = &starting_after {
                query.push(("starting_after", cursor.clone()));
            }

            let page: ListPage<Price> = self.get("/v1/prices", &query).await?;
            let last_id = page.data.last().map(|p| p.id.clone());
            prices.extend(page.data);

            if !page.has_more {
                break;
            }
            match last_id {
                Some(id) => starting_after = Some(id),
                None => break,
            }
        }

        Ok(prices)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, StripeError> {
        tracing::debug!(method = "GET", path = %path, "stripe.request");
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.secret_key)
            .header("stripe-version", STRIPE_VERSION)
            .query(query)
            .send()
            .await?;

        let result = Self::decode(resp).await;
        if let Err(err) = &result {
            tracing::warn!(method = "GET", path = %path, error = %err, "stripe.request_failed");
        }
        result
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T, StripeError> {
        tracing::debug!(
            method = "POST",
            path = %path,
            idempotent = idempotency_key.is_some(),
            "stripe.request"
        );
        let mut req = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.secret_key)
            .header("stripe-version", STRIPE_VERSION)
            .form(form);
        if let Some(key) = idempotency_key {
            req = req.header("idempotency-key", key);
        }
        let resp = req.send().await?;

        let result = Self::decode(resp).await;
        if let Err(err) = &result {
            tracing::warn!(method = "POST", path = %path, error = %err, "stripe.request_failed");
        }
        result
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, StripeError> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|_| StripeError::InvalidResponse);
        }

        let mut envelope = resp
            .json::<ApiErrorEnvelope>()
            .await
            .map_err(|_| StripeError::InvalidResponse)?;
        envelope.error.status = status.as_u16();
        Err(StripeError::Api(envelope.error))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(
        error_type: &str,
        code: Option<&str>,
        param: Option<&str>,
        message: &str,
    ) -> StripeError {
        StripeError::Api(StripeApiError {
            status: 404,
            error_type: error_type.to_string(),
            code: code.map(str::to_string),
            param: param.map(str::to_string),
            message: message.to_string(),
        })
    }

    #[test]
    fn missing_customer_matches_structured_error() {
        let err = api_error(
            "invalid_request_error",
            Some("resource_missing"),
            Some("customer"),
            "No such customer: 'cus_gone'",
        );
        assert!(err.is_missing_customer("cus_gone"));
    }

    #[test]
    fn missing_customer_matches_message_with_known_id() {
        let err = api_error(
            "invalid_request_error",
            None,
            None,
            "No such customer: 'cus_gone'",
        );
        assert!(err.is_missing_customer("cus_gone"));
        assert!(!err.is_missing_customer("cus_other"));
    }

    #[test]
    fn missing_customer_ignores_other_errors() {
        let err = api_error(
            "invalid_request_error",
            Some("resource_missing"),
            Some("price"),
            "No such price: 'price_1'",
        );
        assert!(!err.is_missing_customer("cus_gone"));
        assert!(!StripeError::Timeout.is_missing_customer("cus_gone"));
    }

    #[test]
    fn error_envelope_decodes_api_shape() {
        let raw = serde_json::json!({
            "error": {
                "type": "invalid_request_error",
                "code": "resource_missing",
                "param": "customer",
                "message": "No such customer: 'cus_x'"
            }
        });
        let envelope: ApiErrorEnvelope = serde_json::from_value(raw).expect("should decode");
        assert_eq!(envelope.error.code.as_deref(), Some("resource_missing"));
    }
}
