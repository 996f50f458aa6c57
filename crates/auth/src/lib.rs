//! Bearer-token validation for the authenticated billing surface. Access
//! tokens are Supabase-issued HS256 JWTs; the gateway only needs the caller
//! identity — workspace membership is checked against the store afterwards.

use std::time::Duration;

use http::header;
use http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Clone)]
pub struct TokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(jwt_secret: &str, clock_skew: Duration) -> Result<Self, AuthError> {
        if jwt_secret.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "jwt secret must be non-empty".to_string(),
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = clock_skew.as_secs();
        validation.validate_exp = true;
        // Supabase sets aud to "authenticated"; membership is checked
        // separately, so audience is not load-bearing here.
        validation.validate_aud = false;

        Ok(Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation,
        })
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;

        let decoded = decode::<AccessTokenClaims>(&token, &self.decoding_key, &self.validation)
            .map_err(|_| AuthError {
                code: "ERR_AUTH_INVALID",
                message: "invalid or expired access token".to_string(),
            })?;

        let user_id = Uuid::parse_str(&decoded.claims.sub).map_err(|_| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "access token subject is not a user id".to_string(),
        })?;

        Ok(Principal {
            user_id,
            role: decoded.claims.role,
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_MISSING",
            message: "missing Authorization header".to_string(),
        })?;

    let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")) else {
        return Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Authorization header must use the Bearer scheme".to_string(),
        });
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Authorization header carries an empty token".to_string(),
        });
    }

    Ok(token.to_string())
}

/// Roles allowed to drive billing for a workspace.
pub fn can_manage_billing(role: &str) -> bool {
    matches!(role, "owner" | "admin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &str = "super-secret-jwt-key";

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        role: String,
        exp: u64,
    }

    fn token_for(sub: &str, exp_offset_secs: i64) -> String {
        let exp = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock after epoch")
            .as_secs() as i64
            + exp_offset_secs) as u64;
        encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                sub: sub.to_string(),
                role: "authenticated".to_string(),
                exp,
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("encoding should succeed")
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", token).parse().expect("header value"),
        );
        headers
    }

    #[test]
    fn valid_token_yields_principal() {
        let validator = TokenValidator::new(SECRET, Duration::from_secs(60)).unwrap();
        let user_id = "7f0c0c5e-30d6-4b5c-8f53-6b1f9d2a4e11";
        let headers = headers_with(&token_for(user_id, 3600));

        let principal = validator.authenticate(&headers).expect("should authenticate");
        assert_eq!(principal.user_id.to_string(), user_id);
        assert_eq!(principal.role.as_deref(), Some("authenticated"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let validator = TokenValidator::new(SECRET, Duration::from_secs(0)).unwrap();
        let headers = headers_with(&token_for("7f0c0c5e-30d6-4b5c-8f53-6b1f9d2a4e11", -3600));
        let err = validator.authenticate(&headers).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_INVALID");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let validator = TokenValidator::new("other-secret", Duration::from_secs(60)).unwrap();
        let headers = headers_with(&token_for("7f0c0c5e-30d6-4b5c-8f53-6b1f9d2a4e11", 3600));
        assert!(validator.authenticate(&headers).is_err());
    }

    #[test]
    fn non_uuid_subject_is_rejected() {
        let validator = TokenValidator::new(SECRET, Duration::from_secs(60)).unwrap();
        let headers = headers_with(&token_for("service-account", 3600));
        let err = validator.authenticate(&headers).unwrap_err();
        assert!(err.message.contains("not a user id"));
    }

    #[test]
    fn missing_and_malformed_headers_are_rejected() {
        let validator = TokenValidator::new(SECRET, Duration::from_secs(60)).unwrap();

        let err = validator.authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_MISSING");

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        let err = validator.authenticate(&headers).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_INVALID");
    }

    #[test]
    fn billing_roles() {
        assert!(can_manage_billing("owner"));
        assert!(can_manage_billing("admin"));
        assert!(!can_manage_billing("member"));
        assert!(!can_manage_billing("viewer"));
    }
}
