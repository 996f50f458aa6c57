//! Webhook ingestion and the internal operations surface (catalog sync,
//! scheduler tick). Ingestion answers as soon as the event row is durable;
//! processing happens on the worker and, for anything missed, on the
//! scheduler's retry pass.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{
    header_string, json_error, json_error_ctx, new_correlation_id, tokens_match, ApiError,
    AppState,
};

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    duplicate: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
}

pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    let Some(signature) = header_string(&headers, "stripe-signature") else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "Missing Stripe signature",
            None,
        ));
    };

    // Size guard before any verification or insert work. Prefer the
    // declared length; fall back to what actually arrived.
    let declared_len = header_string(&headers, "content-length")
        .and_then(|raw| raw.parse::<usize>().ok());
    let effective_len = declared_len.unwrap_or(body.len()).max(body.len());
    if effective_len > state.config.stripe_webhook_max_body_bytes {
        return Err(json_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Webhook payload too large",
            None,
        ));
    }

    if formsandbox_stripe::verify_signature(
        &body,
        &signature,
        &state.config.stripe_webhook_signing_secret,
        state.config.stripe_webhook_tolerance_secs,
        Utc::now().timestamp(),
    )
    .is_err()
    {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "Invalid Stripe signature",
            None,
        ));
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "Invalid event payload",
                None,
            ));
        }
    };
    let envelope: EventEnvelope = match serde_json::from_value(payload.clone()) {
        Ok(envelope) => envelope,
        Err(_) => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "Invalid event payload",
                None,
            ));
        }
    };

    let inserted = state
        .store
        .insert_webhook_event(&envelope.id, &envelope.event_type, &payload)
        .await
        .map_err(|err| {
            let correlation_id = new_correlation_id();
            tracing::error!(
                event_id = %envelope.id,
                correlation_id = %correlation_id,
                error = %err,
                "webhook.ingest_failed"
            );
            json_error_ctx(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to ingest event",
                None,
                serde_json::json!({"correlation_id": correlation_id}),
            )
        })?;

    if !inserted {
        return Ok(Json(IngestResponse {
            received: true,
            duplicate: Some(true),
        }));
    }

    tracing::info!(
        event_id = %envelope.id,
        event_type = %envelope.event_type,
        "webhook.ingested"
    );

    // Off the request path: the row is durable, the lease protocol owns the
    // rest.
    state.worker.enqueue(&envelope.id);

    Ok(Json(IngestResponse {
        received: true,
        duplicate: None,
    }))
}

pub async fn catalog_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_internal_token(&state, &headers)?;
    let correlation_id = new_correlation_id();

    let report = state.billing.sync_catalog().await.map_err(|err| {
        tracing::error!(
            correlation_id = %correlation_id,
            error = %err,
            "billing.catalog_sync_failed"
        );
        json_error_ctx(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Catalog sync failed",
            Some("CATALOG_SYNC_FAILED"),
            serde_json::json!({"correlation_id": correlation_id}),
        )
    })?;

    Ok(Json(serde_json::json!({
        "scanned_prices": report.scanned_prices,
        "eligible_prices": report.eligible_prices,
        "updated_variants": report.updated_variants,
        "missing_variants": report.missing_variants,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickRequest {
    cron: String,
}

pub async fn scheduler_tick(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TickRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_internal_token(&state, &headers)?;

    let Json(request) = body.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "body must be {cron}",
            Some("FIELD_VALIDATION_FAILED"),
        )
    })?;

    let report = state
        .billing
        .run_scheduled_tick(&request.cron)
        .await
        .map_err(|err| {
            tracing::error!(cron = %request.cron, error = %err, "billing.tick_failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Scheduler tick failed",
                Some("SCHEDULER_TICK_FAILED"),
            )
        })?;

    let catalog = report.catalog.as_ref().map(|c| {
        serde_json::json!({
            "scanned_prices": c.scanned_prices,
            "eligible_prices": c.eligible_prices,
            "updated_variants": c.updated_variants,
            "missing_variants": c.missing_variants,
        })
    });

    Ok(Json(serde_json::json!({
        "handler": report.handler,
        "retried": report.retried,
        "completed": report.completed,
        "failed": report.failed,
        "not_claimed": report.not_claimed,
        "downgraded": report.downgraded,
        "purged": report.purged,
        "catalog": catalog,
    })))
}

/// Internal endpoints accept the token via `x-internal-admin-token` or a
/// bearer Authorization header; comparison is constant-time. With no token
/// configured the surface stays closed.
fn require_internal_token(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.stripe_internal_admin_token.as_deref() else {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            "Internal surface is not enabled",
            None,
        ));
    };

    let presented = header_string(headers, "x-internal-admin-token").or_else(|| {
        header_string(headers, "authorization")
            .and_then(|raw| raw.strip_prefix("Bearer ").map(str::to_string))
    });

    match presented {
        Some(token) if tokens_match(expected, &token) => Ok(()),
        _ => Err(json_error(
            StatusCode::FORBIDDEN,
            "Invalid internal token",
            None,
        )),
    }
}
