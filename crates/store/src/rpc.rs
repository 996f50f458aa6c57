//! SQL-function invocations. The functions themselves are owned by the
//! database; their signatures are fixed collaborator contracts. Calls that
//! act on behalf of an anonymous caller run on the request pool inside a
//! transaction that installs the forwarded request headers, so the
//! functions observe the same `request.headers` PostgREST would provide.

use chrono::{DateTime, FixedOffset};
use formsandbox_contracts::Entitlement;
use sqlx::Row;
use uuid::Uuid;

use crate::{Store, StoreError};

/// Request metadata forwarded into the database session.
#[derive(Debug, Clone, Default)]
pub struct ForwardedHeaders {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

impl ForwardedHeaders {
    fn to_header_json(&self) -> serde_json::Value {
        let mut headers = serde_json::Map::new();
        if let Some(ip) = &self.ip {
            headers.insert("x-forwarded-for".to_string(), ip.clone().into());
        }
        if let Some(user_agent) = &self.user_agent {
            headers.insert("user-agent".to_string(), user_agent.clone().into());
        }
        if let Some(referer) = &self.referer {
            headers.insert("referer".to_string(), referer.clone().into());
        }
        serde_json::Value::Object(headers)
    }
}

/// Public row of a published form, as returned by
/// `get_published_form_by_id`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PublishedForm {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub published_schema: serde_json::Value,
    pub success_message: Option<String>,
    pub redirect_url: Option<String>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    pub meta_image_url: Option<String>,
    pub captcha_enabled: bool,
    pub captcha_provider: Option<String>,
    pub require_auth: bool,
    pub password_protected: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubmissionQuota {
    pub feature_key: String,
    pub is_enabled: bool,
    pub limit_value: i64,
    pub current_usage: i64,
    pub workspace_id: Uuid,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedWebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnsureFreeOutcome {
    pub subscription_id: Uuid,
    pub created: bool,
}

impl Store {
    /// Strict rate-limit gate for anonymous submissions. The function reads
    /// the forwarded headers installed on the transaction; a machine-
    /// readable refusal surfaces as [`StoreError::RateLimited`].
    pub async fn check_request(&self, headers: &ForwardedHeaders) -> Result<(), StoreError> {
        let header_json = headers.to_header_json().to_string();
        self.timed(async {
            let mut tx = self.request_pool().begin().await?;
            sqlx::query("SELECT set_config('request.headers', $1, true)")
                .bind(&header_json)
                .execute(&mut *tx)
                .await?;
            sqlx::query("SELECT check_request()")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn get_published_form_by_id(
        &self,
        form_id: Uuid,
    ) -> Result<Option<PublishedForm>, StoreError> {
        self.timed(async {
            let form = sqlx::query_as::<_, PublishedForm>(
                "SELECT id, workspace_id, title, description, published_schema, success_message, redirect_url, meta_title, meta_description, meta_image_url, captcha_enabled, captcha_provider, require_auth, password_protected FROM get_published_form_by_id($1)",
            )
            .bind(form_id)
            .fetch_optional(self.request_pool())
            .await?;
            Ok(form)
        })
        .await
    }

    pub async fn get_form_submission_quota(
        &self,
        form_id: Uuid,
    ) -> Result<SubmissionQuota, StoreError> {
        self.timed(async {
            let quota = sqlx::query_as::<_, SubmissionQuota>(
                "SELECT feature_key, is_enabled, limit_value, current_usage, workspace_id FROM get_form_submission_quota($1)",
            )
            .bind(form_id)
            .fetch_one(self.request_pool())
            .await?;
            Ok(quota)
        })
        .await
    }

    /// Transactional submission handoff. Replays on the same idempotency
    /// key return the original submission id from inside the function.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_form(
        &self,
        form_id: Uuid,
        data: &serde_json::Value,
        idempotency_key: Uuid,
        headers: &ForwardedHeaders,
        started_at: Option<DateTime<FixedOffset>>,
    ) -> Result<Uuid, StoreError> {
        let header_json = headers.to_header_json().to_string();
        self.timed(async {
            let mut tx = self.request_pool().begin().await?;
            sqlx::query("SELECT set_config('request.headers', $1, true)")
                .bind(&header_json)
                .execute(&mut *tx)
                .await?;
            let row = sqlx::query(
                "SELECT submit_form($1, $2, $3, $4, $5, $6, $7) AS submission_id",
            )
            .bind(form_id)
            .bind(data)
            .bind(idempotency_key)
            .bind(&headers.ip)
            .bind(&headers.user_agent)
            .bind(&headers.referer)
            .bind(started_at)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(row.try_get::<Uuid, _>("submission_id")?)
        })
        .await
    }

    /// Idempotent free-tier convergence; serialized in the database by an
    /// advisory lock keyed on the workspace.
    pub async fn ensure_free_subscription_for_workspace(
        &self,
        workspace_id: Uuid,
        source: &str,
    ) -> Result<EnsureFreeOutcome, StoreError> {
        self.timed(async {
            let outcome = sqlx::query_as::<_, EnsureFreeOutcome>(
                "SELECT subscription_id, created FROM ensure_free_subscription_for_workspace($1, $2)",
            )
            .bind(workspace_id)
            .bind(source)
            .fetch_one(self.service_pool())
            .await?;
            Ok(outcome)
        })
        .await
    }

    /// Atomic lease acquisition. Returns the claimed row with its payload,
    /// or `None` when the event is not claimable (done, leased elsewhere,
    /// not yet due, or out of attempts).
    pub async fn claim_stripe_webhook_event(
        &self,
        event_id: &str,
        processor_id: &str,
        ttl_seconds: i64,
        max_attempts: i32,
    ) -> Result<Option<ClaimedWebhookEvent>, StoreError> {
        self.timed(async {
            let claimed = sqlx::query_as::<_, ClaimedWebhookEvent>(
                "SELECT event_id, event_type, payload, attempts FROM claim_stripe_webhook_event($1, $2, $3, $4)",
            )
            .bind(event_id)
            .bind(processor_id)
            .bind(ttl_seconds)
            .bind(max_attempts)
            .fetch_optional(self.service_pool())
            .await?;
            Ok(claimed)
        })
        .await
    }

    pub async fn get_workspace_entitlements(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<Entitlement>, StoreError> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT feature_key, is_enabled, limit_value FROM get_workspace_entitlements($1)",
            )
            .bind(workspace_id)
            .fetch_all(self.service_pool())
            .await?;

            let mut entitlements = Vec::with_capacity(rows.len());
            for row in rows {
                entitlements.push(Entitlement {
                    feature_key: row.try_get("feature_key")?,
                    is_enabled: row.try_get("is_enabled")?,
                    limit_value: row.try_get("limit_value")?,
                });
            }
            Ok(entitlements)
        })
        .await
    }

    /// Workspace membership lookup for the authenticated billing surface.
    /// Returns the member's role, or `None` when the user is not a member.
    pub async fn get_workspace_role(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<String>, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT role FROM workspace_members WHERE workspace_id = $1 AND user_id = $2",
            )
            .bind(workspace_id)
            .bind(user_id)
            .fetch_optional(self.service_pool())
            .await?;
            Ok(match row {
                Some(row) => Some(row.try_get("role")?),
                None => None,
            })
        })
        .await
    }

}
