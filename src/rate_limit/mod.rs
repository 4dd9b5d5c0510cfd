/// Rate Limiting System
///
/// Per-client limits on the login and `/me` routes, counted either in
/// process (governor) or in Redis (`distributed`).

pub mod distributed;

pub use distributed::DistributedRateLimiter;

use crate::{
    cache::CacheClient,
    config::{RateLimitBackend, RateLimitSettings},
    context::AppContext,
    error::{ServiceError, ServiceResult},
    metrics,
};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter as GovernorLimiter,
};
use std::{net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};
use tracing::{debug, warn};

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Routes with their own request budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitedRoute {
    Login,
    Me,
}

impl LimitedRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitedRoute::Login => "login",
            LimitedRoute::Me => "me",
        }
    }
}

/// In-process limiter keyed by client address
#[derive(Clone)]
pub struct MemoryRateLimiter {
    login: Arc<KeyedLimiter>,
    me: Arc<KeyedLimiter>,
}

impl MemoryRateLimiter {
    pub fn new(login_requests: u32, me_requests: u32, window: Duration) -> ServiceResult<Self> {
        Ok(Self {
            login: Arc::new(GovernorLimiter::keyed(quota(login_requests, window)?)),
            me: Arc::new(GovernorLimiter::keyed(quota(me_requests, window)?)),
        })
    }

    pub fn check(&self, route: LimitedRoute, client: &str) -> ServiceResult<()> {
        let limiter = match route {
            LimitedRoute::Login => &self.login,
            LimitedRoute::Me => &self.me,
        };

        limiter
            .check_key(&client.to_string())
            .map_err(|not_until| ServiceError::RateLimitExceeded {
                retry_after: not_until.wait_time_from(DefaultClock::default().now()),
            })
    }
}

impl MemoryRateLimiter {
    /// Forget clients whose buckets have refilled
    pub fn retain_recent(&self) {
        for limiter in [&self.login, &self.me] {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// Number of clients currently tracked across both routes
    pub fn tracked_clients(&self) -> usize {
        self.login.len() + self.me.len()
    }
}

/// `requests` per `window`, all of which may arrive at once
fn quota(requests: u32, window: Duration) -> ServiceResult<Quota> {
    let burst = NonZeroU32::new(requests).ok_or_else(|| {
        ServiceError::Validation("Rate limit must allow at least one request".to_string())
    })?;

    Quota::with_period(window / requests)
        .map(|quota| quota.allow_burst(burst))
        .ok_or_else(|| ServiceError::Validation("Rate limit window must be positive".to_string()))
}

/// Rate limiter manager
#[derive(Clone)]
pub enum RateLimiter {
    Disabled,
    Memory(MemoryRateLimiter),
    Distributed(DistributedRateLimiter),
}

impl RateLimiter {
    /// Build the configured limiter. The Redis backend needs a cache client.
    pub fn from_settings(
        settings: &RateLimitSettings,
        cache: Option<CacheClient>,
    ) -> ServiceResult<Self> {
        if !settings.enabled {
            return Ok(RateLimiter::Disabled);
        }

        let window = Duration::from_secs(settings.window_secs);

        match (settings.backend, cache) {
            (RateLimitBackend::Memory, _) => Ok(RateLimiter::Memory(MemoryRateLimiter::new(
                settings.login_requests,
                settings.me_requests,
                window,
            )?)),
            (RateLimitBackend::Redis, Some(cache)) => {
                Ok(RateLimiter::Distributed(DistributedRateLimiter::new(
                    cache,
                    settings.login_requests,
                    settings.me_requests,
                    window,
                )))
            }
            (RateLimitBackend::Redis, None) => Err(ServiceError::Internal(
                "Redis rate limiting requires a cache connection".to_string(),
            )),
        }
    }

    /// Check one request against the route budget
    pub async fn check(&self, route: LimitedRoute, client: &str) -> ServiceResult<()> {
        let result = match self {
            RateLimiter::Disabled => Ok(()),
            RateLimiter::Memory(limiter) => limiter.check(route, client),
            RateLimiter::Distributed(limiter) => match limiter.check(route, client).await {
                Err(ServiceError::Cache(e)) => {
                    warn!("Rate limit store unavailable, allowing request: {}", e);
                    Ok(())
                }
                other => other,
            },
        };

        if result.is_err() {
            metrics::record_rate_limit_rejection(route.as_str());
        }

        result
    }
}

/// Periodically drop idle client state from the in-process limiter.
/// Redis counters expire on their own.
pub fn spawn_pruning(limiter: Arc<RateLimiter>, period: Duration) {
    let RateLimiter::Memory(memory) = limiter.as_ref() else {
        return;
    };
    let memory = memory.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            memory.retain_recent();
            debug!("Rate limiter pruned, {} clients tracked", memory.tracked_clients());
        }
    });
}

/// Client identity for rate limiting
fn client_key(connect_info: Option<ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate limiting middleware for the login route
pub async fn limit_login(
    State(ctx): State<AppContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    ctx.rate_limiter
        .check(LimitedRoute::Login, &client_key(connect_info))
        .await?;
    Ok(next.run(request).await)
}

/// Rate limiting middleware for the `/me` route
pub async fn limit_me(
    State(ctx): State<AppContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    ctx.rate_limiter
        .check(LimitedRoute::Me, &client_key(connect_info))
        .await?;
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_limit() {
        let limiter = MemoryRateLimiter::new(3, 5, Duration::from_secs(60)).unwrap();

        for _ in 0..3 {
            assert!(limiter.check(LimitedRoute::Login, "10.0.0.1").is_ok());
        }

        match limiter.check(LimitedRoute::Login, "10.0.0.1") {
            Err(ServiceError::RateLimitExceeded { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(20));
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[test]
    fn test_clients_and_routes_are_independent() {
        let limiter = MemoryRateLimiter::new(1, 1, Duration::from_secs(60)).unwrap();

        assert!(limiter.check(LimitedRoute::Login, "10.0.0.1").is_ok());
        assert!(limiter.check(LimitedRoute::Login, "10.0.0.1").is_err());

        assert!(limiter.check(LimitedRoute::Login, "10.0.0.2").is_ok());
        assert!(limiter.check(LimitedRoute::Me, "10.0.0.1").is_ok());
    }

    #[test]
    fn test_retain_recent_drops_refilled_clients() {
        let limiter = MemoryRateLimiter::new(1, 1, Duration::from_millis(20)).unwrap();
        for i in 0..5 {
            limiter.check(LimitedRoute::Login, &format!("10.0.0.{}", i)).unwrap();
        }
        limiter.check(LimitedRoute::Me, "10.0.0.1").unwrap();
        assert_eq!(limiter.tracked_clients(), 6);

        std::thread::sleep(Duration::from_millis(50));
        limiter.retain_recent();
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_zero_quota_rejected() {
        assert!(MemoryRateLimiter::new(0, 5, Duration::from_secs(60)).is_err());
        assert!(MemoryRateLimiter::new(5, 5, Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let settings = RateLimitSettings {
            enabled: false,
            backend: RateLimitBackend::Memory,
            login_requests: 1,
            me_requests: 1,
            window_secs: 60,
        };
        let limiter = RateLimiter::from_settings(&settings, None).unwrap();

        for _ in 0..10 {
            assert!(limiter.check(LimitedRoute::Login, "x").await.is_ok());
        }
    }

    #[test]
    fn test_redis_backend_requires_cache() {
        let settings = RateLimitSettings {
            enabled: true,
            backend: RateLimitBackend::Redis,
            login_requests: 1,
            me_requests: 1,
            window_secs: 60,
        };
        assert!(RateLimiter::from_settings(&settings, None).is_err());
    }

    #[test]
    fn test_client_key() {
        let addr: SocketAddr = "192.168.1.20:5555".parse().unwrap();
        assert_eq!(client_key(Some(ConnectInfo(addr))), "192.168.1.20");
        assert_eq!(client_key(None), "unknown");
    }
}
