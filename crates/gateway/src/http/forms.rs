//! Public runner surface: schema fetch and the submission pipeline
//! (rate-limit → schema load → sanitize → validate → quota → persist).
//! Every step is fail-closed; nothing is skipped on a slow upstream.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, FixedOffset};
use formsandbox_schema::logic::evaluate_visibility;
use formsandbox_schema::parse_contract;
use formsandbox_schema::validate::validate_values;
use formsandbox_store::{ForwardedHeaders, StoreError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{client_ip, header_string, json_error, json_error_ctx, ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    form: FormView,
}

#[derive(Debug, Serialize)]
struct FormView {
    id: Uuid,
    title: String,
    description: Option<String>,
    published_schema: serde_json::Value,
    success_message: Option<String>,
    redirect_url: Option<String>,
    meta_title: Option<String>,
    meta_description: Option<String>,
    meta_image_url: Option<String>,
    captcha_enabled: bool,
    captcha_provider: Option<String>,
    require_auth: bool,
    password_protected: bool,
}

pub async fn get_schema(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
) -> Result<Json<SchemaResponse>, ApiError> {
    let Ok(form_id) = Uuid::parse_str(form_id.trim()) else {
        return Err(json_error(StatusCode::NOT_FOUND, "Form not found", None));
    };

    let form = state
        .store
        .get_published_form_by_id(form_id)
        .await
        .map_err(|err| {
            tracing::error!(form_id = %form_id, error = %err, "runner.schema_load_failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load form",
                Some("RUNNER_INTERNAL_ERROR"),
            )
        })?;

    let Some(form) = form else {
        return Err(json_error(StatusCode::NOT_FOUND, "Form not found", None));
    };

    Ok(Json(SchemaResponse {
        form: FormView {
            id: form.id,
            title: form.title,
            description: form.description,
            published_schema: form.published_schema,
            success_message: form.success_message,
            redirect_url: form.redirect_url,
            meta_title: form.meta_title,
            meta_description: form.meta_description,
            meta_image_url: form.meta_image_url,
            captcha_enabled: form.captcha_enabled,
            captcha_provider: form.captcha_provider,
            require_auth: form.require_auth,
            password_protected: form.password_protected,
        },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    started_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    submission_id: Uuid,
    success_message: Option<String>,
    redirect_url: Option<String>,
}

pub async fn submit(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Ok(form_id) = Uuid::parse_str(form_id.trim()) else {
        return Err(field_validation_error(vec![
            "form id must be a UUID".to_string()
        ]));
    };

    let idempotency_key = match header_string(&headers, "idempotency-key")
        .and_then(|raw| Uuid::parse_str(&raw).ok())
    {
        Some(key) => key,
        None => {
            return Err(field_validation_error(vec![
                "Idempotency-Key header must be a UUID".to_string(),
            ]));
        }
    };

    let Json(request) = body.map_err(|_| {
        field_validation_error(vec!["request body must be a JSON object with `data`".to_string()])
    })?;

    let started_at: Option<DateTime<FixedOffset>> = match &request.started_at {
        None => None,
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts),
            Err(_) => {
                return Err(field_validation_error(vec![
                    "started_at must be an ISO-8601 timestamp with offset".to_string(),
                ]));
            }
        },
    };

    let forwarded = ForwardedHeaders {
        ip: client_ip(&headers),
        user_agent: header_string(&headers, "user-agent"),
        referer: header_string(&headers, "referer"),
    };

    // Strict gate first: 2 submissions / 60 s per anonymous IP, enforced in
    // the database. Inability to evaluate the gate fails closed.
    if let Err(err) = state.store.check_request(&forwarded).await {
        return Err(match err {
            StoreError::RateLimited(payload) => {
                let message = payload
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("Too many requests")
                    .to_string();
                json_error(StatusCode::TOO_MANY_REQUESTS, message, Some("RATE_LIMITED"))
            }
            other => {
                tracing::error!(form_id = %form_id, error = %other, "runner.rate_limit_check_failed");
                json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to evaluate rate limit",
                    Some("RATE_LIMIT_CHECK_FAILED"),
                )
            }
        });
    }

    let form = state
        .store
        .get_published_form_by_id(form_id)
        .await
        .map_err(|err| {
            tracing::error!(form_id = %form_id, error = %err, "runner.form_load_failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load form",
                Some("RUNNER_INTERNAL_ERROR"),
            )
        })?;
    let Some(form) = form else {
        return Err(json_error(StatusCode::NOT_FOUND, "Form not found", None));
    };

    let contract = match parse_contract(&form.published_schema) {
        Ok(contract) => contract,
        Err(issues) => {
            return Err(json_error_ctx(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Form schema is not supported",
                Some("UNSUPPORTED_FORM_SCHEMA"),
                serde_json::json!({ "issues": issues.issues }),
            ));
        }
    };

    // Reject unknown keys before visibility stripping: a key outside the
    // registry is a contract violation, not merely hidden.
    let unknown_fields: Vec<String> = request
        .data
        .keys()
        .filter(|key| !contract.contains(key))
        .cloned()
        .collect();
    if !unknown_fields.is_empty() {
        return Err(json_error_ctx(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Submission contains unknown fields",
            Some("FIELD_VALIDATION_FAILED"),
            serde_json::json!({ "unknown_fields": unknown_fields }),
        ));
    }

    let visibility = evaluate_visibility(&contract, &request.data);
    let mut sanitized = request.data.clone();
    sanitized.retain(|key, _| visibility.get(key).copied().unwrap_or(false));

    let errors = validate_values(&contract, &sanitized, &visibility);
    if !errors.is_empty() {
        let issues: Vec<serde_json::Value> = errors
            .iter()
            .map(|e| serde_json::json!({"field_id": e.field_id, "message": e.message}))
            .collect();
        return Err(json_error_ctx(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Submitted values failed validation",
            Some("FIELD_VALIDATION_FAILED"),
            serde_json::json!({ "issues": issues }),
        ));
    }

    let quota = state
        .store
        .get_form_submission_quota(form_id)
        .await
        .map_err(|err| {
            tracing::error!(form_id = %form_id, error = %err, "runner.quota_check_failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to evaluate submission quota",
                Some("RUNNER_INTERNAL_ERROR"),
            )
        })?;

    if !quota.is_enabled {
        return Err(json_error_ctx(
            StatusCode::FORBIDDEN,
            "Submissions are not available on the current plan",
            Some("PLAN_FEATURE_DISABLED"),
            serde_json::json!({
                "feature": quota.feature_key,
                "current": quota.current_usage,
                "allowed": quota.limit_value,
                "upgrade_url": state.config.upgrade_url,
            }),
        ));
    }
    if quota.limit_value >= 0 && quota.current_usage >= quota.limit_value {
        return Err(json_error_ctx(
            StatusCode::FORBIDDEN,
            "Submission limit reached for the current plan",
            Some("PLAN_LIMIT_EXCEEDED"),
            serde_json::json!({
                "feature": quota.feature_key,
                "current": quota.current_usage,
                "allowed": quota.limit_value,
                "upgrade_url": state.config.upgrade_url,
            }),
        ));
    }

    let submission_id = state
        .store
        .submit_form(
            form_id,
            &serde_json::Value::Object(sanitized),
            idempotency_key,
            &forwarded,
            started_at,
        )
        .await
        .map_err(|err| match err {
            StoreError::NotFound => json_error(StatusCode::NOT_FOUND, "Form not found", None),
            StoreError::Forbidden => json_error(
                StatusCode::FORBIDDEN,
                "Submission is not allowed for this form",
                None,
            ),
            StoreError::Conflict(_) => {
                json_error(StatusCode::CONFLICT, "Form state conflict", None)
            }
            other => {
                tracing::error!(form_id = %form_id, error = %other, "runner.submit_failed");
                json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to submit form",
                    Some("RUNNER_INTERNAL_ERROR"),
                )
            }
        })?;

    tracing::info!(
        form_id = %form_id,
        submission_id = %submission_id,
        idempotency_key = %idempotency_key,
        "runner.submission_accepted"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            submission_id,
            success_message: form.success_message,
            redirect_url: form.redirect_url,
        }),
    ))
}

fn field_validation_error(issues: Vec<String>) -> ApiError {
    json_error_ctx(
        StatusCode::BAD_REQUEST,
        "Request failed validation",
        Some("FIELD_VALIDATION_FAILED"),
        serde_json::json!({ "issues": issues }),
    )
}
