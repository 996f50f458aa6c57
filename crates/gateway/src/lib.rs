//! Multi-tenant HTTP gateway for the form builder: public submission
//! runner, subscription-billing surface, webhook ingestion, and the
//! scheduled-reconciliation trigger. Durable state lives in Postgres; the
//! billing provider is the source of truth for billing.

pub mod config;
pub mod http;
