/// Application context and dependency injection
use crate::{
    account::{token::TokenIssuer, AccountManager},
    cache::{CacheClient, MemorySessionCache, RedisSessionCache, SessionCache},
    config::ServerConfig,
    db::{self, account::SqliteAccountRepository, DatabaseOptions},
    error::ServiceResult,
    rate_limit::RateLimiter,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub account_db: SqlitePool,
    pub account_manager: Arc<AccountManager>,
    pub session_cache: Arc<dyn SessionCache>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Whether `session_cache` is backed by Redis
    pub cache_enabled: bool,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> ServiceResult<Self> {
        // Validate configuration
        config.validate()?;

        // Initialize account database
        let account_db = db::create_pool(
            &config.storage.database_url,
            DatabaseOptions::from(&config.storage),
        )
        .await?;

        // Run migrations
        db::run_migrations(&account_db).await?;
        info!("Account database ready at {}", config.storage.database_url);

        // Shared cache, or a process-local one when Redis is off
        let cache_client = if config.cache.enabled {
            Some(CacheClient::new(&config.cache).await?)
        } else {
            info!("Redis cache disabled, using in-process session cache");
            None
        };

        let session_cache: Arc<dyn SessionCache> = match &cache_client {
            Some(client) => Arc::new(RedisSessionCache::new(client.clone())),
            None => Arc::new(MemorySessionCache::new()),
        };

        let rate_limiter = Arc::new(RateLimiter::from_settings(&config.rate_limit, cache_client)?);

        let account_manager = Arc::new(AccountManager::new(
            Arc::new(SqliteAccountRepository::new(account_db.clone())),
            session_cache.clone(),
            TokenIssuer::from_config(&config.authentication),
            &config.cache,
        ));

        Ok(Self {
            cache_enabled: config.cache.enabled,
            config: Arc::new(config),
            account_db,
            account_manager,
            session_cache,
            rate_limiter,
        })
    }

    /// Release pooled connections
    pub async fn close(&self) {
        self.account_db.close().await;
        info!("Account database closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_from_test_config() {
        let ctx = AppContext::new(ServerConfig::for_tests()).await.unwrap();

        assert!(!ctx.cache_enabled);
        assert!(db::test_connection(&ctx.account_db).await.is_ok());
        assert!(ctx.session_cache.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = ServerConfig::for_tests();
        config.authentication.jwt_secret = "short".to_string();

        assert!(AppContext::new(config).await.is_err());
    }
}
