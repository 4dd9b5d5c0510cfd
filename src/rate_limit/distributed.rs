/// Distributed rate limiting using Redis
///
/// Fixed-window counters shared by every accountd instance pointed at the
/// same Redis.

use super::LimitedRoute;
use crate::cache::{categories, CacheClient};
use crate::error::{ServiceError, ServiceResult};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

/// Distributed rate limiter using Redis
#[derive(Clone)]
pub struct DistributedRateLimiter {
    cache: CacheClient,
    login_requests: u32,
    me_requests: u32,
    window: Duration,
}

impl DistributedRateLimiter {
    /// Create a new distributed rate limiter
    pub fn new(cache: CacheClient, login_requests: u32, me_requests: u32, window: Duration) -> Self {
        Self {
            cache,
            login_requests,
            me_requests,
            window,
        }
    }

    /// Count the request and reject it once the window is full
    pub async fn check(&self, route: LimitedRoute, client: &str) -> ServiceResult<()> {
        let window_secs = self.window.as_secs().max(1);
        let now = Utc::now().timestamp().max(0) as u64;
        let key = window_key(route, client, now / window_secs);

        let count = self
            .cache
            .increment(categories::RATE_LIMIT, &key, self.window)
            .await?;

        let limit = match route {
            LimitedRoute::Login => self.login_requests,
            LimitedRoute::Me => self.me_requests,
        };

        debug!("Rate limit check: {} => {}/{}", key, count, limit);

        if count > limit as i64 {
            warn!("Rate limit exceeded for {}: {}/{}", key, count, limit);
            return Err(ServiceError::RateLimitExceeded {
                retry_after: Duration::from_secs(window_secs - now % window_secs),
            });
        }

        Ok(())
    }
}

fn window_key(route: LimitedRoute, client: &str, window: u64) -> String {
    format!("{}:{}:{}", route.as_str(), client, window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_separates_routes_and_clients() {
        assert_eq!(window_key(LimitedRoute::Login, "10.0.0.1", 7), "login:10.0.0.1:7");
        assert_ne!(
            window_key(LimitedRoute::Login, "10.0.0.1", 7),
            window_key(LimitedRoute::Me, "10.0.0.1", 7)
        );
        assert_ne!(
            window_key(LimitedRoute::Login, "10.0.0.1", 7),
            window_key(LimitedRoute::Login, "10.0.0.1", 8)
        );
    }
}
