//! Gateway configuration: environment variables merged over an optional
//! KEY=VALUE file named by `FORMSANDBOX_CONFIG_PATH`. Every parse failure
//! is a startup error with a stable code; the process refuses to start on
//! bad config rather than limping.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use formsandbox_billing::BillingConfig;
use formsandbox_store::StoreConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,

    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub supabase_jwt_secret: String,
    pub db_pool_size: u32,
    pub db_connect_timeout_ms: u64,
    pub db_statement_timeout_ms: u64,

    pub stripe_secret_key: String,
    pub stripe_webhook_signing_secret: String,
    pub stripe_api_base_url: String,
    pub stripe_http_timeout_ms: u64,
    pub stripe_webhook_tolerance_secs: i64,
    pub stripe_webhook_max_body_bytes: usize,
    pub stripe_webhook_claim_ttl_seconds: i64,
    pub stripe_retry_batch_size: i64,
    pub stripe_grace_batch_size: i64,
    pub stripe_catalog_sync_enabled: bool,
    pub stripe_catalog_sync_cron: String,
    pub stripe_catalog_env: Option<String>,
    pub stripe_internal_admin_token: Option<String>,

    pub billing_grace_days: i64,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub billing_portal_return_url: String,
    pub contact_sales_url: String,
    pub upgrade_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("FORMSANDBOX_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("FORMSANDBOX_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "FORMSANDBOX_BIND_ADDR",
        )?;

        let supabase_url = require_nonempty(kv, "SUPABASE_URL")?;
        let supabase_anon_key = require_nonempty(kv, "SUPABASE_ANON_KEY")?;
        let supabase_service_role_key = require_nonempty(kv, "SUPABASE_SERVICE_ROLE_KEY")?;
        let supabase_jwt_secret = require_nonempty(kv, "SUPABASE_JWT_SECRET")?;

        let db_pool_size = parse_u32(kv.get("FORMSANDBOX_DB_POOL_SIZE"), 8, "FORMSANDBOX_DB_POOL_SIZE")?;
        if db_pool_size == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "FORMSANDBOX_DB_POOL_SIZE must be >= 1".to_string(),
            });
        }
        let db_connect_timeout_ms = parse_u64(
            kv.get("FORMSANDBOX_DB_CONNECT_TIMEOUT_MS"),
            5000,
            "FORMSANDBOX_DB_CONNECT_TIMEOUT_MS",
        )?;
        let db_statement_timeout_ms = parse_u64(
            kv.get("FORMSANDBOX_DB_STATEMENT_TIMEOUT_MS"),
            10_000,
            "FORMSANDBOX_DB_STATEMENT_TIMEOUT_MS",
        )?;

        let stripe_secret_key = require_nonempty(kv, "STRIPE_SECRET_KEY")?;
        let stripe_webhook_signing_secret = require_nonempty(kv, "STRIPE_WEBHOOK_SIGNING_SECRET")?;
        let stripe_api_base_url = optional(kv, "STRIPE_API_BASE_URL")
            .unwrap_or_else(|| "https://api.stripe.com".to_string());
        let stripe_http_timeout_ms = parse_u64(
            kv.get("STRIPE_HTTP_TIMEOUT_MS"),
            15_000,
            "STRIPE_HTTP_TIMEOUT_MS",
        )?;
        let stripe_webhook_tolerance_secs = parse_u64(
            kv.get("STRIPE_WEBHOOK_TOLERANCE_SECS"),
            300,
            "STRIPE_WEBHOOK_TOLERANCE_SECS",
        )? as i64;
        let stripe_webhook_max_body_bytes = parse_usize(
            kv.get("STRIPE_WEBHOOK_MAX_BODY_BYTES"),
            262_144,
            "STRIPE_WEBHOOK_MAX_BODY_BYTES",
        )?;
        let stripe_webhook_claim_ttl_seconds = parse_u64(
            kv.get("STRIPE_WEBHOOK_CLAIM_TTL_SECONDS"),
            300,
            "STRIPE_WEBHOOK_CLAIM_TTL_SECONDS",
        )? as i64;
        if stripe_webhook_claim_ttl_seconds == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "STRIPE_WEBHOOK_CLAIM_TTL_SECONDS must be >= 1".to_string(),
            });
        }
        let stripe_retry_batch_size = parse_u64(
            kv.get("STRIPE_RETRY_BATCH_SIZE"),
            200,
            "STRIPE_RETRY_BATCH_SIZE",
        )? as i64;
        let stripe_grace_batch_size = parse_u64(
            kv.get("STRIPE_GRACE_BATCH_SIZE"),
            500,
            "STRIPE_GRACE_BATCH_SIZE",
        )? as i64;
        let stripe_catalog_sync_enabled =
            parse_bool(kv.get("STRIPE_CATALOG_SYNC_ENABLED")).unwrap_or(true);
        let stripe_catalog_sync_cron = optional(kv, "STRIPE_CATALOG_SYNC_CRON")
            .unwrap_or_else(|| "*/15 * * * *".to_string());
        let stripe_catalog_env = optional(kv, "STRIPE_CATALOG_ENV");
        let stripe_internal_admin_token = optional(kv, "STRIPE_INTERNAL_ADMIN_TOKEN");

        let billing_grace_days =
            parse_u64(kv.get("BILLING_GRACE_DAYS"), 7, "BILLING_GRACE_DAYS")? as i64;

        let checkout_success_url = require_nonempty(kv, "CHECKOUT_SUCCESS_URL")?;
        let checkout_cancel_url = require_nonempty(kv, "CHECKOUT_CANCEL_URL")?;
        let billing_portal_return_url = require_nonempty(kv, "BILLING_PORTAL_RETURN_URL")?;
        let contact_sales_url = optional(kv, "CONTACT_SALES_URL")
            .unwrap_or_else(|| "https://formsandbox.io/contact-sales".to_string());
        let upgrade_url = optional(kv, "FORMSANDBOX_UPGRADE_URL")
            .unwrap_or_else(|| billing_portal_return_url.clone());

        Ok(Self {
            bind_addr,
            supabase_url,
            supabase_anon_key,
            supabase_service_role_key,
            supabase_jwt_secret,
            db_pool_size,
            db_connect_timeout_ms,
            db_statement_timeout_ms,
            stripe_secret_key,
            stripe_webhook_signing_secret,
            stripe_api_base_url,
            stripe_http_timeout_ms,
            stripe_webhook_tolerance_secs,
            stripe_webhook_max_body_bytes,
            stripe_webhook_claim_ttl_seconds,
            stripe_retry_batch_size,
            stripe_grace_batch_size,
            stripe_catalog_sync_enabled,
            stripe_catalog_sync_cron,
            stripe_catalog_env,
            stripe_internal_admin_token,
            billing_grace_days,
            checkout_success_url,
            checkout_cancel_url,
            billing_portal_return_url,
            contact_sales_url,
            upgrade_url,
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            url: self.supabase_url.clone(),
            anon_key: self.supabase_anon_key.clone(),
            service_role_key: self.supabase_service_role_key.clone(),
            pool_size: self.db_pool_size,
            connect_timeout: Duration::from_millis(self.db_connect_timeout_ms),
            statement_timeout: Duration::from_millis(self.db_statement_timeout_ms),
        }
    }

    pub fn billing_config(&self) -> BillingConfig {
        BillingConfig {
            grace_days: self.billing_grace_days,
            webhook_claim_ttl_seconds: self.stripe_webhook_claim_ttl_seconds,
            webhook_max_attempts: 8,
            retry_batch_size: self.stripe_retry_batch_size,
            grace_batch_size: self.stripe_grace_batch_size,
            catalog_sync_enabled: self.stripe_catalog_sync_enabled,
            catalog_sync_cron: self.stripe_catalog_sync_cron.clone(),
            catalog_env: self.stripe_catalog_env.clone(),
            checkout_success_url: self.checkout_success_url.clone(),
            checkout_cancel_url: self.checkout_cancel_url.clone(),
            portal_return_url: self.billing_portal_return_url.clone(),
        }
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        let value = strip_quotes(value.trim());
        kv.insert(key.to_string(), value);
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn optional(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_ok_env() -> HashMap<String, String> {
        HashMap::from(
            [
                ("SUPABASE_URL", "postgres://db.internal:5432/formsandbox"),
                ("SUPABASE_ANON_KEY", "anon-key"),
                ("SUPABASE_SERVICE_ROLE_KEY", "service-key"),
                ("SUPABASE_JWT_SECRET", "jwt-secret"),
                ("STRIPE_SECRET_KEY", "sk_test_123"),
                ("STRIPE_WEBHOOK_SIGNING_SECRET", "whsec_123"),
                ("CHECKOUT_SUCCESS_URL", "https://app.formsandbox.io/billing/success"),
                ("CHECKOUT_CANCEL_URL", "https://app.formsandbox.io/billing/cancel"),
                ("BILLING_PORTAL_RETURN_URL", "https://app.formsandbox.io/settings/billing"),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[test]
    fn minimal_env_loads_with_defaults() {
        let config = GatewayConfig::from_kv(&minimal_ok_env()).expect("should load");
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.stripe_webhook_max_body_bytes, 262_144);
        assert_eq!(config.stripe_webhook_claim_ttl_seconds, 300);
        assert_eq!(config.stripe_retry_batch_size, 200);
        assert_eq!(config.stripe_grace_batch_size, 500);
        assert_eq!(config.billing_grace_days, 7);
        assert!(config.stripe_catalog_sync_enabled);
        assert_eq!(config.stripe_catalog_sync_cron, "*/15 * * * *");
        assert!(config.stripe_catalog_env.is_none());
        assert!(config.stripe_internal_admin_token.is_none());
        assert_eq!(config.stripe_api_base_url, "https://api.stripe.com");
    }

    #[test]
    fn missing_required_key_fails_with_code() {
        let mut env = minimal_ok_env();
        env.remove("STRIPE_SECRET_KEY");
        let err = GatewayConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_MISSING_CONFIG");
        assert!(err.message.contains("STRIPE_SECRET_KEY"));
    }

    #[test]
    fn invalid_bind_addr_fails() {
        let mut env = minimal_ok_env();
        env.insert("FORMSANDBOX_BIND_ADDR".to_string(), "not-an-addr".to_string());
        let err = GatewayConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn zero_claim_ttl_fails() {
        let mut env = minimal_ok_env();
        env.insert("STRIPE_WEBHOOK_CLAIM_TTL_SECONDS".to_string(), "0".to_string());
        let err = GatewayConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn catalog_flags_parse() {
        let mut env = minimal_ok_env();
        env.insert("STRIPE_CATALOG_SYNC_ENABLED".to_string(), "false".to_string());
        env.insert("STRIPE_CATALOG_ENV".to_string(), "prod".to_string());
        env.insert("STRIPE_CATALOG_SYNC_CRON".to_string(), "*/30 * * * *".to_string());
        let config = GatewayConfig::from_kv(&env).expect("should load");
        assert!(!config.stripe_catalog_sync_enabled);
        assert_eq!(config.stripe_catalog_env.as_deref(), Some("prod"));
        assert_eq!(config.stripe_catalog_sync_cron, "*/30 * * * *");
    }

    #[test]
    fn upgrade_url_defaults_to_portal_return() {
        let config = GatewayConfig::from_kv(&minimal_ok_env()).expect("should load");
        assert_eq!(config.upgrade_url, config.billing_portal_return_url);

        let mut env = minimal_ok_env();
        env.insert(
            "FORMSANDBOX_UPGRADE_URL".to_string(),
            "https://app.formsandbox.io/upgrade".to_string(),
        );
        let config = GatewayConfig::from_kv(&env).expect("should load");
        assert_eq!(config.upgrade_url, "https://app.formsandbox.io/upgrade");
    }
}
