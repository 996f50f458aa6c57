//! Authenticated billing surface: checkout sessions, portal sessions, and
//! the entitlements read. Callers must be an owner or admin of the target
//! workspace; identity comes from the bearer token, membership from the
//! store.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use formsandbox_auth::can_manage_billing;
use formsandbox_billing::CheckoutError;
use formsandbox_contracts::{BillingInterval, Entitlement, PlanSlug};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    header_string, json_error, json_error_ctx, new_correlation_id, ApiError, AppState,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckoutRequest {
    plan_slug: String,
    interval: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    url: String,
    session_id: String,
    destination: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    idempotent_replay: Option<bool>,
}

pub async fn create_checkout_session(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let correlation_id = new_correlation_id();

    let workspace_id = parse_workspace_id(&workspace_id)?;
    let user_id = authorize_billing(&state, &headers, workspace_id).await?;

    let client_key = match header_string(&headers, "idempotency-key")
        .and_then(|raw| Uuid::parse_str(&raw).ok())
    {
        Some(key) => key,
        None => {
            return Err(json_error_ctx(
                StatusCode::BAD_REQUEST,
                "Request failed validation",
                Some("FIELD_VALIDATION_FAILED"),
                serde_json::json!({"issues": ["Idempotency-Key header must be a UUID"]}),
            ));
        }
    };

    let Json(request) = body.map_err(|_| {
        json_error_ctx(
            StatusCode::BAD_REQUEST,
            "Request failed validation",
            Some("FIELD_VALIDATION_FAILED"),
            serde_json::json!({"issues": ["body must be {plan_slug, interval}"]}),
        )
    })?;

    let Some(plan) = PlanSlug::parse(&request.plan_slug) else {
        return Err(json_error_ctx(
            StatusCode::BAD_REQUEST,
            "Unknown plan",
            Some("FIELD_VALIDATION_FAILED"),
            serde_json::json!({"issues": [format!("unknown plan_slug `{}`", request.plan_slug)]}),
        ));
    };
    match plan {
        PlanSlug::Free => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "The free plan has no checkout",
                Some("INVALID_PLAN_FOR_CHECKOUT"),
            ));
        }
        PlanSlug::Enterprise => {
            return Err(json_error_ctx(
                StatusCode::FORBIDDEN,
                "Enterprise plans are not self-serve",
                Some("CONTACT_SALES_REQUIRED"),
                serde_json::json!({"contact_sales_url": state.config.contact_sales_url}),
            ));
        }
        PlanSlug::Pro | PlanSlug::Business => {}
    }

    let Some(interval) = BillingInterval::parse(&request.interval) else {
        return Err(json_error_ctx(
            StatusCode::BAD_REQUEST,
            "Unknown billing interval",
            Some("FIELD_VALIDATION_FAILED"),
            serde_json::json!({"issues": [format!("unknown interval `{}`", request.interval)]}),
        ));
    };

    if state.config.checkout_success_url.is_empty()
        || state.config.checkout_cancel_url.is_empty()
        || state.config.billing_portal_return_url.is_empty()
    {
        return Err(billing_5xx(
            "Billing is not configured",
            "BILLING_CONFIG_MISSING",
            &correlation_id,
        ));
    }

    let outcome = state
        .billing
        .start_checkout(
            workspace_id,
            Some(user_id),
            plan,
            interval,
            client_key,
            &correlation_id,
        )
        .await
        .map_err(|err| match err {
            CheckoutError::KeyReusedWithDifferentPayload => json_error(
                StatusCode::CONFLICT,
                "Idempotency key was reused with a different payload",
                Some("IDEMPOTENCY_KEY_REUSED_WITH_DIFFERENT_PAYLOAD"),
            ),
            CheckoutError::KeyExpired => json_error(
                StatusCode::CONFLICT,
                "Idempotency key has expired",
                Some("IDEMPOTENCY_KEY_EXPIRED"),
            ),
            CheckoutError::InProgress => json_error(
                StatusCode::CONFLICT,
                "A checkout for this key is already in progress",
                Some("CHECKOUT_IN_PROGRESS"),
            ),
            CheckoutError::CatalogOutOfSync => json_error(
                StatusCode::CONFLICT,
                "Plan catalog is out of sync",
                Some("CATALOG_OUT_OF_SYNC"),
            ),
            CheckoutError::Billing(err) => {
                tracing::error!(
                    workspace_id = %workspace_id,
                    correlation_id = %correlation_id,
                    error = %err,
                    "billing.checkout_failed"
                );
                billing_5xx(
                    "Failed to create checkout session",
                    "STRIPE_CHECKOUT_SESSION_FAILED",
                    &correlation_id,
                )
            }
        })?;

    tracing::info!(
        workspace_id = %workspace_id,
        correlation_id = %correlation_id,
        destination = outcome.destination,
        idempotent_replay = outcome.idempotent_replay,
        "billing.checkout_session"
    );

    Ok(Json(CheckoutResponse {
        url: outcome.url,
        session_id: outcome.session_id,
        destination: outcome.destination,
        reason: outcome.reason,
        idempotent_replay: outcome.idempotent_replay.then_some(true),
    }))
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    url: String,
}

pub async fn create_portal_session(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PortalResponse>, ApiError> {
    let correlation_id = new_correlation_id();

    let workspace_id = parse_workspace_id(&workspace_id)?;
    authorize_billing(&state, &headers, workspace_id).await?;

    let url = state
        .billing
        .start_portal_session(workspace_id, &correlation_id)
        .await
        .map_err(|err| {
            tracing::error!(
                workspace_id = %workspace_id,
                correlation_id = %correlation_id,
                error = %err,
                "billing.portal_failed"
            );
            billing_5xx(
                "Failed to create portal session",
                "STRIPE_PORTAL_SESSION_FAILED",
                &correlation_id,
            )
        })?;

    Ok(Json(PortalResponse { url }))
}

#[derive(Debug, Serialize)]
pub struct EntitlementsResponse {
    entitlements: Vec<Entitlement>,
}

pub async fn get_entitlements(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EntitlementsResponse>, ApiError> {
    let workspace_id = parse_workspace_id(&workspace_id)?;

    let principal = state
        .tokens
        .authenticate(&headers)
        .map_err(|err| json_error(StatusCode::UNAUTHORIZED, err.message, None))?;

    let role = state
        .store
        .get_workspace_role(workspace_id, principal.user_id)
        .await
        .map_err(|_| internal_error())?;
    if role.is_none() {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "Workspace access denied",
            None,
        ));
    }

    let entitlements = state
        .store
        .get_workspace_entitlements(workspace_id)
        .await
        .map_err(|_| internal_error())?;

    Ok(Json(EntitlementsResponse { entitlements }))
}

fn parse_workspace_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        json_error_ctx(
            StatusCode::BAD_REQUEST,
            "Request failed validation",
            Some("FIELD_VALIDATION_FAILED"),
            serde_json::json!({"issues": ["workspace id must be a UUID"]}),
        )
    })
}

/// Authenticates the bearer token and requires an owner/admin membership.
/// Returns the caller's user id for fingerprinting.
async fn authorize_billing(
    state: &AppState,
    headers: &HeaderMap,
    workspace_id: Uuid,
) -> Result<Uuid, ApiError> {
    let principal = state
        .tokens
        .authenticate(headers)
        .map_err(|err| json_error(StatusCode::UNAUTHORIZED, err.message, None))?;

    let role = state
        .store
        .get_workspace_role(workspace_id, principal.user_id)
        .await
        .map_err(|_| internal_error())?;

    match role {
        Some(role) if can_manage_billing(&role) => Ok(principal.user_id),
        _ => Err(json_error(
            StatusCode::FORBIDDEN,
            "Workspace access denied",
            None,
        )),
    }
}

fn billing_5xx(message: &str, code: &str, correlation_id: &str) -> ApiError {
    json_error_ctx(
        StatusCode::INTERNAL_SERVER_ERROR,
        message,
        Some(code),
        serde_json::json!({"correlation_id": correlation_id}),
    )
}

fn internal_error() -> ApiError {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal error",
        None,
    )
}
