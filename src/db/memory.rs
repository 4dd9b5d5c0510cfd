/// In-memory account repository used by service and API tests
use super::account::{
    Account, AccountChanges, AccountRepository, AccountTransaction, NewAccount, Page, Visibility,
};
use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Store {
    next_id: i64,
    rows: BTreeMap<i64, Account>,
}

impl Store {
    /// Mirror of the UNIQUE constraints on username and email
    fn check_unique(&self, candidate: &Account) -> ServiceResult<()> {
        for row in self.rows.values().filter(|row| row.id != candidate.id) {
            if row.username == candidate.username {
                return Err(ServiceError::UniquenessViolation(
                    "UNIQUE constraint failed: accounts.username".to_string(),
                ));
            }
            if row.email == candidate.email {
                return Err(ServiceError::UniquenessViolation(
                    "UNIQUE constraint failed: accounts.email".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Repository over a shared map. Transactions hold the map lock and work on
/// a copy that replaces the map on commit.
#[derive(Clone, Default)]
pub struct MemoryAccountRepository {
    store: Arc<Mutex<Store>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn list(&self, page: Page, visibility: Visibility) -> ServiceResult<Vec<Account>> {
        let store = self.store.lock().await;
        Ok(store
            .rows
            .values()
            .filter(|a| visibility.admits(a.is_active, a.is_deleted))
            .skip(page.skip.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: i64, visibility: Visibility) -> ServiceResult<Option<Account>> {
        let store = self.store.lock().await;
        Ok(store
            .rows
            .get(&id)
            .filter(|a| visibility.admits(a.is_active, a.is_deleted))
            .cloned())
    }

    async fn find_by_username(&self, username: &str) -> ServiceResult<Option<Account>> {
        let store = self.store.lock().await;
        Ok(store
            .rows
            .values()
            .find(|a| a.username == username)
            .cloned())
    }

    async fn begin(&self) -> ServiceResult<Box<dyn AccountTransaction>> {
        let guard = self.store.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryAccountTransaction { guard, working }))
    }
}

pub struct MemoryAccountTransaction {
    guard: OwnedMutexGuard<Store>,
    working: Store,
}

#[async_trait]
impl AccountTransaction for MemoryAccountTransaction {
    async fn find_by_id(&mut self, id: i64) -> ServiceResult<Option<Account>> {
        Ok(self.working.rows.get(&id).cloned())
    }

    async fn find_conflicts(
        &mut self,
        exclude_id: Option<i64>,
        email: Option<&str>,
        username: Option<&str>,
    ) -> ServiceResult<Option<Account>> {
        Ok(self
            .working
            .rows
            .values()
            .filter(|a| Some(a.id) != exclude_id)
            .find(|a| email == Some(a.email.as_str()) || username == Some(a.username.as_str()))
            .cloned())
    }

    async fn insert(&mut self, account: NewAccount) -> ServiceResult<Account> {
        let created = Account {
            id: self.working.next_id + 1,
            username: account.username,
            email: account.email,
            password_hash: account.password_hash,
            is_active: true,
            is_deleted: false,
            created_at: Utc::now(),
        };
        self.working.check_unique(&created)?;

        self.working.next_id = created.id;
        self.working.rows.insert(created.id, created.clone());
        Ok(created)
    }

    async fn apply_update(
        &mut self,
        account: &Account,
        changes: &AccountChanges,
    ) -> ServiceResult<Account> {
        let mut updated = self
            .working
            .rows
            .get(&account.id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound("Account not found".to_string()))?;
        changes.merge_into(&mut updated);
        self.working.check_unique(&updated)?;

        self.working.rows.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn purge(&mut self, account: &Account) -> ServiceResult<()> {
        self.working.rows.remove(&account.id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> ServiceResult<()> {
        let MemoryAccountTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ServiceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_publishes_and_drop_discards() {
        let repo = MemoryAccountRepository::new();

        let mut tx = repo.begin().await.unwrap();
        tx.insert(NewAccount {
            username: "kept".to_string(),
            email: "kept@example.com".to_string(),
            password_hash: "h".to_string(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        {
            let mut tx = repo.begin().await.unwrap();
            tx.insert(NewAccount {
                username: "lost".to_string(),
                email: "lost@example.com".to_string(),
                password_hash: "h".to_string(),
            })
            .await
            .unwrap();
        }

        assert!(repo.find_by_username("kept").await.unwrap().is_some());
        assert!(repo.find_by_username("lost").await.unwrap().is_none());
    }
}
