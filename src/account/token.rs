/// Signed access tokens (HS256 JWT)
use crate::config::AuthConfig;
use crate::error::{ServiceError, ServiceResult};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Username of the account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub exp: i64,
    pub iat: i64,
}

/// Issues and verifies access tokens with a server-held secret
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    lifetime: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            lifetime,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            &config.jwt_secret,
            Duration::minutes(config.access_token_expire_minutes),
        )
    }

    /// Issue a token for `subject` expiring after the configured lifetime
    pub fn issue(&self, subject: &str, account_id: i64) -> ServiceResult<String> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: Some(subject.to_string()),
            id: Some(account_id),
            exp: (now + self.lifetime).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(format!("Token encoding failed: {}", e)))
    }

    /// Verify signature and expiry and return the claims
    pub fn decode(&self, token: &str) -> ServiceResult<AccessClaims> {
        decode::<AccessClaims>(token, &self.decoding_key, &self.validation(true))
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("Token verification failed: {}", e);
                ServiceError::InvalidToken(e.to_string())
            })
    }

    /// Time left before a correctly signed token expires.
    ///
    /// `None` for tokens this issuer did not sign or that are already expired.
    pub fn remaining_lifetime(&self, token: &str) -> Option<std::time::Duration> {
        let claims = decode::<AccessClaims>(token, &self.decoding_key, &self.validation(false))
            .ok()?
            .claims;
        let remaining = claims.exp - Utc::now().timestamp();
        (remaining > 0).then(|| std::time::Duration::from_secs(remaining as u64))
    }

    fn validation(&self, check_expiry: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        // Issued and checked against the same clock
        validation.leeway = 0;
        validation.validate_exp = check_expiry;
        if !check_expiry {
            validation.required_spec_claims.clear();
        }
        validation
    }
}
