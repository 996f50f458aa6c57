//! Router assembly and the helpers shared by every handler: the error
//! envelope, correlation ids, client-ip extraction, and the panic guard on
//! the public runner.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use formsandbox_auth::TokenValidator;
use formsandbox_billing::worker::{spawn_webhook_worker, WebhookWorker};
use formsandbox_billing::BillingService;
use formsandbox_store::Store;
use formsandbox_stripe::StripeClient;
use futures::FutureExt;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{GatewayConfig, StartupError};

mod billing;
mod forms;
mod webhook;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Store,
    pub billing: BillingService,
    pub worker: WebhookWorker,
    pub tokens: TokenValidator,
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let store = Store::connect(&config.store_config())
        .await
        .map_err(|err| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: format!("failed to initialize database pools: {}", err),
        })?;

    let stripe = StripeClient::new(
        config.stripe_secret_key.clone(),
        config.stripe_api_base_url.clone(),
        Duration::from_millis(config.stripe_http_timeout_ms),
    )
    .map_err(|_| StartupError {
        code: "ERR_STRIPE_UNAVAILABLE",
        message: "failed to initialize stripe client".to_string(),
    })?;

    let tokens = TokenValidator::new(&config.supabase_jwt_secret, Duration::from_secs(60))
        .map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: err.message,
        })?;

    let billing = BillingService::new(store.clone(), stripe, config.billing_config());
    let worker = spawn_webhook_worker(billing.clone());

    let body_limit = config.stripe_webhook_max_body_bytes.max(1024 * 1024);
    let state = AppState {
        config: Arc::new(config),
        store,
        billing,
        worker,
        tokens,
    };

    let public = Router::new()
        .route("/api/v1/f/{form_id}/schema", get(forms::get_schema))
        .route("/api/v1/f/{form_id}/submit", post(forms::submit))
        .layer(middleware::from_fn(catch_runner_panics));

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .merge(public)
        .route(
            "/api/v1/stripe/workspaces/{workspace_id}/checkout-session",
            post(billing::create_checkout_session),
        )
        .route(
            "/api/v1/stripe/workspaces/{workspace_id}/portal-session",
            post(billing::create_portal_session),
        )
        .route(
            "/api/v1/workspaces/{workspace_id}/entitlements",
            get(billing::get_entitlements),
        )
        .route("/api/v1/stripe/webhook", post(webhook::ingest))
        .route("/api/v1/stripe/catalog/sync", post(webhook::catalog_sync))
        .route(
            "/api/v1/internal/scheduler/tick",
            post(webhook::scheduler_tick),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Non-recoverable panics on the public runner become a stable envelope
/// rather than a dropped connection.
async fn catch_runner_panics(req: Request<Body>, next: Next) -> Response {
    match std::panic::AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to submit form",
            Some("RUNNER_INTERNAL_ERROR"),
        )
        .into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn json_error(status: StatusCode, error: impl Into<String>, code: Option<&str>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
            code: code.map(str::to_string),
            context: serde_json::Map::new(),
        }),
    )
}

/// Error with extra context fields merged into the envelope.
pub fn json_error_ctx(
    status: StatusCode,
    error: impl Into<String>,
    code: Option<&str>,
    context: serde_json::Value,
) -> ApiError {
    let context = match context {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    (
        status,
        Json(ErrorBody {
            error: error.into(),
            code: code.map(str::to_string),
            context,
        }),
    )
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// First well-formed IPv4/IPv6 address from the CDN header, falling back to
/// `x-forwarded-for`. Malformed entries are skipped rather than trusted.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    for name in ["cf-connecting-ip", "x-forwarded-for"] {
        let Some(raw) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        for part in raw.split(',') {
            if let Ok(ip) = part.trim().parse::<IpAddr>() {
                return Some(ip.to_string());
            }
        }
    }
    None
}

pub fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Constant-time token comparison through fixed-width digests.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    use sha2::Digest;
    let a = sha2::Sha256::digest(expected.as_bytes());
    let b = sha2::Sha256::digest(presented.as_bytes());
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_cdn_header_and_skips_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", "not-an-ip, 203.0.113.7".parse().unwrap());
        headers.insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn client_ip_falls_back_to_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "2001:db8::1, 198.51.100.1".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn client_ip_absent_when_nothing_parses() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "unknown".parse().unwrap());
        assert_eq!(client_ip(&headers), None);
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }

    #[test]
    fn error_body_flattens_context() {
        let (_, Json(body)) = json_error_ctx(
            StatusCode::FORBIDDEN,
            "Plan limit exceeded",
            Some("PLAN_LIMIT_EXCEEDED"),
            serde_json::json!({"feature": "submissions", "current": 100, "allowed": 100}),
        );
        let encoded = serde_json::to_value(&body).expect("serializable");
        assert_eq!(encoded["error"], "Plan limit exceeded");
        assert_eq!(encoded["code"], "PLAN_LIMIT_EXCEEDED");
        assert_eq!(encoded["feature"], "submissions");
        assert_eq!(encoded["current"], 100);
    }

    #[test]
    fn token_compare_matches_only_exact_values() {
        assert!(tokens_match("secret-token", "secret-token"));
        assert!(!tokens_match("secret-token", "secret-token2"));
        assert!(!tokens_match("secret-token", ""));
    }
}
