//! Postgres access layer. All durable state lives in the database; the
//! gateway reaches it through the SQL functions listed in the store RPC
//! module and through direct DML on the billing/webhook tables.
//!
//! Two pools are held: the request pool runs as the `anon` role and carries
//! per-request forwarded headers (RLS and the rate-limit gate read them);
//! the service pool runs as `service_role` for workers and reconciliation.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

pub mod billing;
pub mod rpc;
pub mod webhook_events;

pub use rpc::ForwardedHeaders;

#[derive(Debug)]
pub enum StoreError {
    /// The statement-timeout budget elapsed.
    Timeout,
    /// SQLSTATE P0002 from an RPC: the referenced row does not exist.
    NotFound,
    /// SQLSTATE 42501: the current role may not perform the operation.
    Forbidden,
    /// SQLSTATE P0003..P0008: form state conflict. Carries the sqlstate.
    Conflict(String),
    /// SQLSTATE 23505. Carries the constraint name when the driver has it.
    UniqueViolation(String),
    /// `check_request` raised a machine-readable 429 payload.
    RateLimited(serde_json::Value),
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::NotFound => write!(f, "row not found"),
            StoreError::Forbidden => write!(f, "operation forbidden"),
            StoreError::Conflict(code) => write!(f, "state conflict ({})", code),
            StoreError::UniqueViolation(constraint) => {
                write!(f, "unique violation ({})", constraint)
            }
            StoreError::RateLimited(_) => write!(f, "rate limited"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        map_db_error(value)
    }
}

fn map_db_error(err: sqlx::Error) -> StoreError {
    let Some(db) = err.as_database_error() else {
        return StoreError::Sqlx(err);
    };

    if let Some(payload) = rate_limit_payload(db.message()) {
        return StoreError::RateLimited(payload);
    }

    match db.code().as_deref() {
        Some("P0002") => StoreError::NotFound,
        Some("42501") => StoreError::Forbidden,
        Some(code @ ("P0003" | "P0004" | "P0005" | "P0006" | "P0007" | "P0008")) => {
            StoreError::Conflict(code.to_string())
        }
        Some("23505") => {
            StoreError::UniqueViolation(db.constraint().unwrap_or("unknown").to_string())
        }
        _ => StoreError::Sqlx(err),
    }
}

/// `check_request` raises its refusal as a JSON object in the exception
/// message, e.g. `{"code":429,"message":"Too many requests"}`.
fn rate_limit_payload(message: &str) -> Option<serde_json::Value> {
    let trimmed = message.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let payload: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    (payload.get("code")?.as_i64()? == 429).then_some(payload)
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub anon_key: String,
    pub service_role_key: String,
    pub pool_size: u32,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
}

#[derive(Clone)]
pub struct Store {
    request_pool: PgPool,
    service_pool: PgPool,
    statement_timeout: Duration,
}

impl Store {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let request_pool = connect_pool(config, "anon", &config.anon_key).await?;
        let service_pool = connect_pool(config, "service_role", &config.service_role_key).await?;

        Ok(Self {
            request_pool,
            service_pool,
            statement_timeout: config.statement_timeout,
        })
    }

    pub(crate) fn request_pool(&self) -> &PgPool {
        &self.request_pool
    }

    pub(crate) fn service_pool(&self) -> &PgPool {
        &self.service_pool
    }

    /// Applies the per-call statement-timeout budget, mirroring the
    /// deadline the request handler propagates.
    pub(crate) async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.statement_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    pub async fn close(&self) {
        self.request_pool.close().await;
        self.service_pool.close().await;
    }
}

async fn connect_pool(
    config: &StoreConfig,
    role: &str,
    credential: &str,
) -> Result<PgPool, StoreError> {
    let options = PgConnectOptions::from_str(&config.url)
        .map_err(StoreError::Sqlx)?
        .username(role)
        .password(credential);

    let pool = tokio::time::timeout(
        config.connect_timeout,
        PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(options),
    )
    .await
    .map_err(|_| StoreError::Timeout)?
    .map_err(StoreError::Sqlx)?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_payload_requires_machine_readable_429() {
        let payload = rate_limit_payload(r#"{"code":429,"message":"Too many requests"}"#)
            .expect("429 payload should parse");
        assert_eq!(payload["message"], "Too many requests");

        assert!(rate_limit_payload("Too many requests").is_none());
        assert!(rate_limit_payload(r#"{"code":500}"#).is_none());
        assert!(rate_limit_payload(r#"{"message":"x"}"#).is_none());
    }
}
