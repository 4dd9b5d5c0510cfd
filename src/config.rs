/// Configuration management for accountd
use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::env;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection before failing the request
    pub acquire_timeout_secs: u64,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_expire_minutes: i64,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Use Redis; otherwise snapshots and the blacklist live in process memory
    pub enabled: bool,
    pub redis_url: String,
    pub key_prefix: String,
    pub account_ttl: u64,
    /// Fallback blacklist TTL for tokens whose expiry cannot be read
    pub blacklist_ttl: u64,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub backend: RateLimitBackend,
    pub login_requests: u32,
    pub me_requests: u32,
    pub window_secs: u64,
}

/// Where rate limit counters are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackend {
    Memory,
    Redis,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> ServiceResult<Self> {
        dotenv::dotenv().ok();

        let host = env::var("ACCOUNTD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("ACCOUNTD_PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|_| ServiceError::Validation("Invalid port number".to_string()))?;
        let version = env!("CARGO_PKG_VERSION").to_string();

        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/accounts.sqlite".to_string());
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);
        let acquire_timeout_secs = env::var("DATABASE_ACQUIRE_TIMEOUT")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let jwt_secret = env::var("SECRET_KEY")
            .map_err(|_| ServiceError::Validation("SECRET_KEY required".to_string()))?;
        let access_token_expire_minutes = env::var("ACCESS_TOKEN_EXPIRE_MINUTES")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let cache_enabled = env::var("CACHE_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let key_prefix =
            env::var("CACHE_KEY_PREFIX").unwrap_or_else(|_| "accountd:".to_string());
        let account_ttl = env::var("CACHE_ACCOUNT_TTL")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);
        let blacklist_ttl = env::var("CACHE_BLACKLIST_TTL")
            .unwrap_or_else(|_| "1800".to_string())
            .parse()
            .unwrap_or(1800);

        let rate_limit_enabled = env::var("RATE_LIMITS_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let backend = match env::var("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => RateLimitBackend::Memory,
            "redis" => RateLimitBackend::Redis,
            other => {
                return Err(ServiceError::Validation(format!(
                    "Unknown rate limit backend: {}",
                    other
                )))
            }
        };
        let login_requests = env::var("LOGIN_RATE_LIMIT")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);
        let me_requests = env::var("ME_RATE_LIMIT")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .unwrap_or(20);
        let window_secs = env::var("RATE_LIMIT_WINDOW_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let log_level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "accountd=debug,tower_http=debug".to_string());
        let log_json = env::var("ACCOUNTD_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                host,
                port,
                version,
            },
            storage: StorageConfig {
                database_url,
                max_connections,
                acquire_timeout_secs,
            },
            authentication: AuthConfig {
                jwt_secret,
                access_token_expire_minutes,
            },
            cache: CacheSettings {
                enabled: cache_enabled,
                redis_url,
                key_prefix,
                account_ttl,
                blacklist_ttl,
            },
            rate_limit: RateLimitSettings {
                enabled: rate_limit_enabled,
                backend,
                login_requests,
                me_requests,
                window_secs,
            },
            logging: LoggingConfig {
                level: log_level,
                json: log_json,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> ServiceResult<()> {
        if self.service.host.is_empty() {
            return Err(ServiceError::Validation("Host cannot be empty".to_string()));
        }

        if self.authentication.jwt_secret.len() < 32 {
            return Err(ServiceError::Validation(
                "JWT secret must be at least 32 characters".to_string(),
            ));
        }

        if self.authentication.access_token_expire_minutes <= 0 {
            return Err(ServiceError::Validation(
                "Access token lifetime must be positive".to_string(),
            ));
        }

        if self.storage.max_connections == 0 {
            return Err(ServiceError::Validation(
                "Database pool needs at least one connection".to_string(),
            ));
        }

        if self.cache.account_ttl == 0 || self.cache.blacklist_ttl == 0 {
            return Err(ServiceError::Validation(
                "Cache TTLs must be positive".to_string(),
            ));
        }

        if self.rate_limit.enabled {
            if self.rate_limit.login_requests == 0
                || self.rate_limit.me_requests == 0
                || self.rate_limit.window_secs == 0
            {
                return Err(ServiceError::Validation(
                    "Rate limits must allow at least one request per window".to_string(),
                ));
            }

            if self.rate_limit.backend == RateLimitBackend::Redis && !self.cache.enabled {
                return Err(ServiceError::Validation(
                    "Redis rate limiting requires CACHE_ENABLED=true".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Configuration used by unit tests: in-process cache, in-memory limiter
    pub fn for_tests() -> Self {
        ServerConfig {
            service: ServiceConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                version: "test".to_string(),
            },
            storage: StorageConfig {
                database_url: "sqlite::memory:".to_string(),
                max_connections: 1,
                acquire_timeout_secs: 5,
            },
            authentication: AuthConfig {
                jwt_secret: "test-secret-that-is-at-least-32-characters".to_string(),
                access_token_expire_minutes: 30,
            },
            cache: CacheSettings {
                enabled: false,
                redis_url: "redis://localhost:6379".to_string(),
                key_prefix: "accountd:".to_string(),
                account_ttl: 300,
                blacklist_ttl: 1800,
            },
            rate_limit: RateLimitSettings {
                enabled: true,
                backend: RateLimitBackend::Memory,
                login_requests: 10,
                me_requests: 20,
                window_secs: 60,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
        }
    }
}
