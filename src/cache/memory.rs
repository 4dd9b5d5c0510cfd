/// Process-local session cache with per-entry expiry
use super::{AccountKey, SessionCache};
use crate::account::AccountSnapshot;
use crate::error::ServiceResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Entries {
    accounts: HashMap<AccountKey, (AccountSnapshot, Instant)>,
    blacklist: HashMap<String, Instant>,
}

/// Used when Redis is disabled and by tests. State is lost on restart and
/// is not shared between processes.
#[derive(Debug, Default)]
pub struct MemorySessionCache {
    entries: Mutex<Entries>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn get_account(&self, key: &AccountKey) -> ServiceResult<Option<AccountSnapshot>> {
        let mut entries = self.entries.lock().await;
        match entries.accounts.get(key) {
            Some((snapshot, expires_at)) if *expires_at > Instant::now() => {
                Ok(Some(snapshot.clone()))
            }
            Some(_) => {
                entries.accounts.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_account(
        &self,
        key: &AccountKey,
        snapshot: &AccountSnapshot,
        ttl: Duration,
    ) -> ServiceResult<()> {
        let mut entries = self.entries.lock().await;
        entries
            .accounts
            .insert(key.clone(), (snapshot.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn evict_account(&self, key: &AccountKey) -> ServiceResult<()> {
        self.entries.lock().await.accounts.remove(key);
        Ok(())
    }

    async fn blacklist(&self, token: &str, ttl: Duration) -> ServiceResult<()> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.blacklist.retain(|_, expires_at| *expires_at > now);
        entries.blacklist.insert(token.to_string(), now + ttl);
        Ok(())
    }

    async fn is_blacklisted(&self, token: &str) -> ServiceResult<bool> {
        let entries = self.entries.lock().await;
        Ok(entries
            .blacklist
            .get(token)
            .is_some_and(|expires_at| *expires_at > Instant::now()))
    }

    async fn ping(&self) -> ServiceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(id: i64, username: &str) -> AccountSnapshot {
        AccountSnapshot {
            id,
            username: username.to_string(),
            email: format!("{}@example.com", username),
            is_active: true,
            is_deleted: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_set_get_evict() {
        let cache = MemorySessionCache::new();
        let key = AccountKey::Id(1);

        cache
            .set_account(&key, &snapshot(1, "ivan"), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(cache.get_account(&key).await.unwrap().unwrap().username, "ivan");

        cache.evict_account(&key).await.unwrap();
        assert!(cache.get_account(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemorySessionCache::new();
        let key = AccountKey::Username("ivan".to_string());

        cache
            .set_account(&key, &snapshot(1, "ivan"), Duration::from_millis(10))
            .await
            .unwrap();
        cache.blacklist("tok", Duration::from_millis(10)).await.unwrap();
        assert!(cache.is_blacklisted("tok").await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.get_account(&key).await.unwrap().is_none());
        assert!(!cache.is_blacklisted("tok").await.unwrap());
    }
}
