/// Caching layer for accountd
///
/// Holds two kinds of entries:
/// - Account snapshots keyed by id and by username
/// - Revoked (blacklisted) access tokens
///
/// `RedisSessionCache` is the shared production store; `MemorySessionCache`
/// keeps the same data in process when Redis is disabled.

mod memory;

pub use memory::MemorySessionCache;

use crate::account::AccountSnapshot;
use crate::config::CacheSettings;
use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cache key under which an account snapshot is stored
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccountKey {
    Id(i64),
    Username(String),
}

impl AccountKey {
    /// Category prefix and key for this entry
    pub fn parts(&self) -> (&'static str, String) {
        match self {
            AccountKey::Id(id) => (categories::ACCOUNT_ID, id.to_string()),
            AccountKey::Username(name) => (categories::ACCOUNT_NAME, name.clone()),
        }
    }

    /// Label used for hit/miss metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AccountKey::Id(_) => "account_id",
            AccountKey::Username(_) => "account_username",
        }
    }
}

/// Snapshot and blacklist storage used by the account service
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get_account(&self, key: &AccountKey) -> ServiceResult<Option<AccountSnapshot>>;

    async fn set_account(
        &self,
        key: &AccountKey,
        snapshot: &AccountSnapshot,
        ttl: Duration,
    ) -> ServiceResult<()>;

    async fn evict_account(&self, key: &AccountKey) -> ServiceResult<()>;

    /// Record a token as revoked for `ttl`
    async fn blacklist(&self, token: &str, ttl: Duration) -> ServiceResult<()>;

    async fn is_blacklisted(&self, token: &str) -> ServiceResult<bool>;

    /// Check that the backing store is reachable
    async fn ping(&self) -> ServiceResult<()>;
}

/// Redis cache client
#[derive(Clone)]
pub struct CacheClient {
    connection: ConnectionManager,
    key_prefix: String,
}

impl CacheClient {
    /// Create a new cache client
    pub async fn new(settings: &CacheSettings) -> ServiceResult<Self> {
        if !settings.enabled {
            return Err(ServiceError::Internal(
                "Cache is disabled, cannot create client".to_string(),
            ));
        }

        info!("Connecting to Redis at {}", settings.redis_url);

        let client = Client::open(settings.redis_url.as_str()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            ServiceError::Cache(e)
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            ServiceError::Cache(e)
        })?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            key_prefix: settings.key_prefix.clone(),
        })
    }

    /// Build a cache key with prefix
    fn build_key(&self, category: &str, key: &str) -> String {
        build_key(&self.key_prefix, category, key)
    }

    /// Get a JSON value from cache
    pub async fn get<T: DeserializeOwned>(&self, category: &str, key: &str) -> ServiceResult<Option<T>> {
        let cache_key = self.build_key(category, key);

        let mut conn = self.connection.clone();
        let result: Option<String> = conn.get(&cache_key).await.map_err(|e| {
            warn!("Redis GET failed for {}: {}", cache_key, e);
            ServiceError::Cache(e)
        })?;

        match result {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("Failed to deserialize cached value: {}", e);
                    // Delete corrupted cache entry
                    let _ = self.delete(category, key).await;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Set a JSON value in cache with TTL
    pub async fn set<T: Serialize>(
        &self,
        category: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> ServiceResult<()> {
        let json = serde_json::to_string(value).map_err(|e| {
            error!("Failed to serialize value for cache: {}", e);
            ServiceError::Internal(format!("Cache serialization failed: {}", e))
        })?;

        self.set_raw(category, key, json, ttl).await
    }

    /// Set a raw string value with TTL
    pub async fn set_raw(
        &self,
        category: &str,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> ServiceResult<()> {
        let cache_key = self.build_key(category, key);
        let ttl_secs = ttl.as_secs().max(1);

        debug!("Cache SET: {} (TTL: {}s)", cache_key, ttl_secs);

        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(&cache_key, value, ttl_secs)
            .await
            .map_err(|e| {
                warn!("Redis SET failed for {}: {}", cache_key, e);
                ServiceError::Cache(e)
            })?;

        Ok(())
    }

    /// Delete a value from cache
    pub async fn delete(&self, category: &str, key: &str) -> ServiceResult<()> {
        let cache_key = self.build_key(category, key);

        debug!("Cache DELETE: {}", cache_key);

        let mut conn = self.connection.clone();
        conn.del::<_, ()>(&cache_key).await.map_err(|e| {
            warn!("Redis DELETE failed for {}: {}", cache_key, e);
            ServiceError::Cache(e)
        })?;

        Ok(())
    }

    /// Check if a key exists in cache
    pub async fn exists(&self, category: &str, key: &str) -> ServiceResult<bool> {
        let cache_key = self.build_key(category, key);

        let mut conn = self.connection.clone();
        conn.exists(&cache_key).await.map_err(|e| {
            warn!("Redis EXISTS failed for {}: {}", cache_key, e);
            ServiceError::Cache(e)
        })
    }

    /// Increment a counter, starting its TTL on first use (for rate limiting)
    pub async fn increment(&self, category: &str, key: &str, ttl: Duration) -> ServiceResult<i64> {
        let cache_key = self.build_key(category, key);

        let mut conn = self.connection.clone();

        let count: i64 = conn.incr(&cache_key, 1).await.map_err(|e| {
            warn!("Redis INCR failed for {}: {}", cache_key, e);
            ServiceError::Cache(e)
        })?;

        if count == 1 {
            conn.expire::<_, ()>(&cache_key, ttl.as_secs().max(1) as i64)
                .await
                .map_err(|e| {
                    warn!("Redis EXPIRE failed for {}: {}", cache_key, e);
                    ServiceError::Cache(e)
                })?;
        }

        Ok(count)
    }

    /// Ping Redis to check connection
    pub async fn ping(&self) -> ServiceResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            error!("Redis PING failed: {}", e);
            ServiceError::Cache(e)
        })?;

        if pong != "PONG" {
            return Err(ServiceError::Internal(
                "Unexpected Redis PING response".to_string(),
            ));
        }

        Ok(())
    }
}

fn build_key(prefix: &str, category: &str, key: &str) -> String {
    format!("{}{}{}", prefix, category, key)
}

/// Redis-backed session cache
#[derive(Clone)]
pub struct RedisSessionCache {
    client: CacheClient,
}

impl RedisSessionCache {
    pub fn new(client: CacheClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionCache for RedisSessionCache {
    async fn get_account(&self, key: &AccountKey) -> ServiceResult<Option<AccountSnapshot>> {
        let (category, key) = key.parts();
        self.client.get(category, &key).await
    }

    async fn set_account(
        &self,
        key: &AccountKey,
        snapshot: &AccountSnapshot,
        ttl: Duration,
    ) -> ServiceResult<()> {
        let (category, key) = key.parts();
        self.client.set(category, &key, snapshot, ttl).await
    }

    async fn evict_account(&self, key: &AccountKey) -> ServiceResult<()> {
        let (category, key) = key.parts();
        self.client.delete(category, &key).await
    }

    async fn blacklist(&self, token: &str, ttl: Duration) -> ServiceResult<()> {
        self.client
            .set_raw(categories::BLACKLIST, token, "true".to_string(), ttl)
            .await
    }

    async fn is_blacklisted(&self, token: &str) -> ServiceResult<bool> {
        self.client.exists(categories::BLACKLIST, token).await
    }

    async fn ping(&self) -> ServiceResult<()> {
        self.client.ping().await
    }
}

/// Cache category constants
pub mod categories {
    pub const ACCOUNT_ID: &str = "user:";
    pub const ACCOUNT_NAME: &str = "user:name:";
    pub const BLACKLIST: &str = "blacklist:";
    pub const RATE_LIMIT: &str = "rate_limit:";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_key() {
        let key = build_key("accountd:", categories::ACCOUNT_ID, "123");
        assert_eq!(key, "accountd:user:123");
    }

    #[test]
    fn test_account_key_parts() {
        assert_eq!(
            AccountKey::Id(7).parts(),
            (categories::ACCOUNT_ID, "7".to_string())
        );
        assert_eq!(
            AccountKey::Username("ivan".to_string()).parts(),
            (categories::ACCOUNT_NAME, "ivan".to_string())
        );
    }

    #[test]
    fn test_id_and_username_keys_never_collide() {
        // A username that looks like an id must not alias the id entry
        let (id_cat, id_key) = AccountKey::Id(42).parts();
        let (name_cat, name_key) = AccountKey::Username("42".to_string()).parts();
        assert_ne!(
            build_key("p:", id_cat, &id_key),
            build_key("p:", name_cat, &name_key)
        );
    }
}
