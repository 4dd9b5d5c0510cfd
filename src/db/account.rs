/// Account database models and operations
use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, Transaction};

const ACCOUNT_COLUMNS: &str =
    "id, username, email, password_hash, is_active, is_deleted, created_at";

/// Account record in the database
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied at registration
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Partial set of mutable fields; `None` leaves the stored value untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountChanges {
    pub username: Option<String>,
    pub email: Option<String>,
    pub is_active: Option<bool>,
    pub is_deleted: Option<bool>,
}

impl AccountChanges {
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.email.is_none()
            && self.is_active.is_none()
            && self.is_deleted.is_none()
    }

    /// Apply the changes to an in-memory copy of an account
    #[cfg(test)]
    pub fn merge_into(&self, account: &mut Account) {
        if let Some(username) = &self.username {
            account.username = username.clone();
        }
        if let Some(email) = &self.email {
            account.email = email.clone();
        }
        if let Some(is_active) = self.is_active {
            account.is_active = is_active;
        }
        if let Some(is_deleted) = self.is_deleted {
            account.is_deleted = is_deleted;
        }
    }
}

/// Which account states a read may return.
///
/// Both flags widen the result: `show_deleted` admits soft-deleted rows,
/// `show_active` admits active rows. The default hides deleted accounts and
/// shows active ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub show_deleted: bool,
    pub show_active: bool,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            show_deleted: false,
            show_active: true,
        }
    }
}

impl Visibility {
    /// Admit every row
    pub const ALL: Visibility = Visibility {
        show_deleted: true,
        show_active: true,
    };

    pub fn new(show_deleted: bool, show_active: bool) -> Self {
        Self {
            show_deleted,
            show_active,
        }
    }

    pub fn admits(&self, is_active: bool, is_deleted: bool) -> bool {
        (self.show_deleted || !is_deleted) && (self.show_active || !is_active)
    }

    fn push_filters(&self, builder: &mut QueryBuilder<'_, Sqlite>, has_where: bool) {
        let mut clauses = Vec::with_capacity(2);
        if !self.show_deleted {
            clauses.push("is_deleted = 0");
        }
        if !self.show_active {
            clauses.push("is_active = 0");
        }

        for (i, clause) in clauses.into_iter().enumerate() {
            builder.push(if has_where || i > 0 { " AND " } else { " WHERE " });
            builder.push(clause);
        }
    }
}

/// Offset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: i64,
    pub limit: i64,
}

/// Read access to accounts plus a factory for write transactions.
///
/// The repository performs no business-rule checks. Uniqueness is enforced
/// by storage and reported as `ServiceError::UniquenessViolation`.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Accounts ordered by id ascending
    async fn list(&self, page: Page, visibility: Visibility) -> ServiceResult<Vec<Account>>;

    async fn find_by_id(&self, id: i64, visibility: Visibility) -> ServiceResult<Option<Account>>;

    async fn find_by_username(&self, username: &str) -> ServiceResult<Option<Account>>;

    /// Open a unit of work holding the write lock until commit or rollback.
    /// Dropping it without `commit` discards staged changes.
    async fn begin(&self) -> ServiceResult<Box<dyn AccountTransaction>>;
}

/// Staged account mutations owned by the caller
#[async_trait]
pub trait AccountTransaction: Send {
    async fn find_by_id(&mut self, id: i64) -> ServiceResult<Option<Account>>;

    /// Any account other than `exclude_id` holding the given email or username
    async fn find_conflicts(
        &mut self,
        exclude_id: Option<i64>,
        email: Option<&str>,
        username: Option<&str>,
    ) -> ServiceResult<Option<Account>>;

    async fn insert(&mut self, account: NewAccount) -> ServiceResult<Account>;

    async fn apply_update(
        &mut self,
        account: &Account,
        changes: &AccountChanges,
    ) -> ServiceResult<Account>;

    /// Irreversibly remove the row
    async fn purge(&mut self, account: &Account) -> ServiceResult<()>;

    async fn commit(self: Box<Self>) -> ServiceResult<()>;

    async fn rollback(self: Box<Self>) -> ServiceResult<()>;
}

/// Translate storage write failures, surfacing unique-constraint hits
fn map_write_error(err: sqlx::Error) -> ServiceError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return ServiceError::UniquenessViolation(db_err.message().to_string());
        }
    }
    ServiceError::Database(err)
}

/// SQLite-backed account repository
#[derive(Clone)]
pub struct SqliteAccountRepository {
    db: SqlitePool,
}

impl SqliteAccountRepository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AccountRepository for SqliteAccountRepository {
    async fn list(&self, page: Page, visibility: Visibility) -> ServiceResult<Vec<Account>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
        builder.push(ACCOUNT_COLUMNS).push(" FROM accounts");
        visibility.push_filters(&mut builder, false);
        builder
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(page.limit)
            .push(" OFFSET ")
            .push_bind(page.skip);

        let accounts = builder
            .build_query_as::<Account>()
            .fetch_all(&self.db)
            .await?;

        Ok(accounts)
    }

    async fn find_by_id(&self, id: i64, visibility: Visibility) -> ServiceResult<Option<Account>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
        builder
            .push(ACCOUNT_COLUMNS)
            .push(" FROM accounts WHERE id = ")
            .push_bind(id);
        visibility.push_filters(&mut builder, true);

        let account = builder
            .build_query_as::<Account>()
            .fetch_optional(&self.db)
            .await?;

        Ok(account)
    }

    async fn find_by_username(&self, username: &str) -> ServiceResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE username = ?1",
            ACCOUNT_COLUMNS
        ))
        .bind(username)
        .fetch_optional(&self.db)
        .await?;

        Ok(account)
    }

    async fn begin(&self) -> ServiceResult<Box<dyn AccountTransaction>> {
        // Deferred transactions fail with SQLITE_BUSY_SNAPSHOT when another
        // writer commits between their first read and first write
        let tx = self.db.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteAccountTransaction { tx }))
    }
}

/// A live SQLite transaction. sqlx rolls it back when dropped uncommitted.
pub struct SqliteAccountTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl AccountTransaction for SqliteAccountTransaction {
    async fn find_by_id(&mut self, id: i64) -> ServiceResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = ?1",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(account)
    }

    async fn find_conflicts(
        &mut self,
        exclude_id: Option<i64>,
        email: Option<&str>,
        username: Option<&str>,
    ) -> ServiceResult<Option<Account>> {
        if email.is_none() && username.is_none() {
            return Ok(None);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
        builder.push(ACCOUNT_COLUMNS).push(" FROM accounts WHERE (");
        {
            let mut matches = builder.separated(" OR ");
            if let Some(email) = email {
                matches.push("email = ").push_bind_unseparated(email.to_string());
            }
            if let Some(username) = username {
                matches
                    .push("username = ")
                    .push_bind_unseparated(username.to_string());
            }
        }
        builder.push(")");
        if let Some(id) = exclude_id {
            builder.push(" AND id != ").push_bind(id);
        }
        builder.push(" ORDER BY id ASC LIMIT 1");

        let account = builder
            .build_query_as::<Account>()
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(account)
    }

    async fn insert(&mut self, account: NewAccount) -> ServiceResult<Account> {
        let created = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (username, email, password_hash, is_active, is_deleted, created_at)
             VALUES (?1, ?2, ?3, 1, 0, ?4)
             RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(&account.username)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_write_error)?;

        Ok(created)
    }

    async fn apply_update(
        &mut self,
        account: &Account,
        changes: &AccountChanges,
    ) -> ServiceResult<Account> {
        if changes.is_empty() {
            return Ok(account.clone());
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE accounts SET ");
        {
            let mut fields = builder.separated(", ");
            if let Some(username) = &changes.username {
                fields.push("username = ").push_bind_unseparated(username.clone());
            }
            if let Some(email) = &changes.email {
                fields.push("email = ").push_bind_unseparated(email.clone());
            }
            if let Some(is_active) = changes.is_active {
                fields.push("is_active = ").push_bind_unseparated(is_active);
            }
            if let Some(is_deleted) = changes.is_deleted {
                fields.push("is_deleted = ").push_bind_unseparated(is_deleted);
            }
        }
        builder
            .push(" WHERE id = ")
            .push_bind(account.id)
            .push(" RETURNING ")
            .push(ACCOUNT_COLUMNS);

        let updated = builder
            .build_query_as::<Account>()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_write_error)?
            .ok_or_else(|| ServiceError::NotFound("Account not found".to_string()))?;

        Ok(updated)
    }

    async fn purge(&mut self, account: &Account) -> ServiceResult<()> {
        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(account.id)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> ServiceResult<()> {
        self.tx.commit().await.map_err(map_write_error)
    }

    async fn rollback(self: Box<Self>) -> ServiceResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn setup_repo() -> SqliteAccountRepository {
        let pool = db::create_pool("sqlite::memory:", db::DatabaseOptions::default())
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        SqliteAccountRepository::new(pool)
    }

    fn new_account(name: &str) -> NewAccount {
        NewAccount {
            username: name.to_string(),
            email: format!("{}@example.com", name),
            password_hash: "hash".to_string(),
        }
    }

    async fn seed(repo: &SqliteAccountRepository, names: &[&str]) -> Vec<Account> {
        let mut tx = repo.begin().await.unwrap();
        let mut created = Vec::new();
        for name in names {
            created.push(tx.insert(new_account(name)).await.unwrap());
        }
        tx.commit().await.unwrap();
        created
    }

    #[tokio::test]
    async fn test_insert_assigns_defaults() {
        let repo = setup_repo().await;
        let accounts = seed(&repo, &["alice"]).await;

        let alice = &accounts[0];
        assert_eq!(alice.id, 1);
        assert!(alice.is_active);
        assert!(!alice.is_deleted);

        let found = repo.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(&found, alice);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_uniqueness_violation() {
        let repo = setup_repo().await;
        seed(&repo, &["alice"]).await;

        let mut tx = repo.begin().await.unwrap();
        let result = tx.insert(new_account("alice")).await;
        assert!(matches!(result, Err(ServiceError::UniquenessViolation(_))));
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_discarded() {
        let repo = setup_repo().await;

        {
            let mut tx = repo.begin().await.unwrap();
            tx.insert(new_account("ghost")).await.unwrap();
            tx.rollback().await.unwrap();
        }
        {
            let mut tx = repo.begin().await.unwrap();
            tx.insert(new_account("dropped")).await.unwrap();
        }

        assert!(repo.find_by_username("ghost").await.unwrap().is_none());
        assert!(repo.find_by_username("dropped").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_read_then_write_transactions_on_file_pool() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("accounts.sqlite").display());
        let pool = db::create_pool(&url, db::DatabaseOptions::default())
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        let repo = SqliteAccountRepository::new(pool.clone());

        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("user{}", i);
                let email = format!("{}@example.com", name);
                let mut tx = repo.begin().await?;
                tx.find_conflicts(None, Some(email.as_str()), Some(name.as_str()))
                    .await?;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                tx.insert(new_account(&name)).await?;
                tx.commit().await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let all = repo
            .list(Page { skip: 0, limit: 100 }, Visibility::ALL)
            .await
            .unwrap();
        assert_eq!(all.len(), 8);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_list_paginates_in_id_order() {
        let repo = setup_repo().await;
        seed(&repo, &["a1", "a2", "a3", "a4", "a5"]).await;

        let page = repo
            .list(Page { skip: 1, limit: 2 }, Visibility::default())
            .await
            .unwrap();

        let ids: Vec<i64> = page.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_visibility_filters() {
        let repo = setup_repo().await;
        let accounts = seed(&repo, &["live", "gone", "idle"]).await;

        let mut tx = repo.begin().await.unwrap();
        tx.apply_update(
            &accounts[1],
            &AccountChanges {
                is_deleted: Some(true),
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.apply_update(
            &accounts[2],
            &AccountChanges {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let page = Page { skip: 0, limit: 10 };
        let names = |accounts: Vec<Account>| -> Vec<String> {
            accounts.into_iter().map(|a| a.username).collect()
        };

        let default = repo.list(page, Visibility::default()).await.unwrap();
        assert_eq!(names(default), vec!["live", "idle"]);

        let with_deleted = repo.list(page, Visibility::new(true, true)).await.unwrap();
        assert_eq!(names(with_deleted), vec!["live", "gone", "idle"]);

        let inactive_only = repo.list(page, Visibility::new(false, false)).await.unwrap();
        assert_eq!(names(inactive_only), vec!["idle"]);

        assert!(repo
            .find_by_id(accounts[1].id, Visibility::default())
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .find_by_id(accounts[1].id, Visibility::new(true, true))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_find_conflicts_excludes_self() {
        let repo = setup_repo().await;
        let accounts = seed(&repo, &["alice", "bob"]).await;

        let mut tx = repo.begin().await.unwrap();

        let own = tx
            .find_conflicts(Some(accounts[0].id), Some("alice@example.com"), Some("alice"))
            .await
            .unwrap();
        assert!(own.is_none());

        let clash = tx
            .find_conflicts(Some(accounts[1].id), Some("alice@example.com"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clash.id, accounts[0].id);

        assert!(tx.find_conflicts(None, None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_update_keeps_identity() {
        let repo = setup_repo().await;
        let accounts = seed(&repo, &["alice"]).await;

        let mut tx = repo.begin().await.unwrap();
        let updated = tx
            .apply_update(
                &accounts[0],
                &AccountChanges {
                    username: Some("alicia".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(updated.id, accounts[0].id);
        assert_eq!(updated.created_at, accounts[0].created_at);
        assert_eq!(updated.username, "alicia");
        assert_eq!(updated.email, "alice@example.com");
    }

    #[tokio::test]
    async fn test_update_into_taken_email_is_uniqueness_violation() {
        let repo = setup_repo().await;
        let accounts = seed(&repo, &["alice", "bob"]).await;

        let mut tx = repo.begin().await.unwrap();
        let result = tx
            .apply_update(
                &accounts[1],
                &AccountChanges {
                    email: Some("alice@example.com".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(ServiceError::UniquenessViolation(_))));
    }

    #[tokio::test]
    async fn test_purge_removes_row() {
        let repo = setup_repo().await;
        let accounts = seed(&repo, &["alice"]).await;

        let mut tx = repo.begin().await.unwrap();
        tx.purge(&accounts[0]).await.unwrap();
        tx.commit().await.unwrap();

        assert!(repo
            .find_by_id(accounts[0].id, Visibility::ALL)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_visibility_admits() {
        let default = Visibility::default();
        assert!(default.admits(true, false));
        assert!(default.admits(false, false));
        assert!(!default.admits(false, true));

        let hide_active = Visibility::new(false, false);
        assert!(!hide_active.admits(true, false));
        assert!(hide_active.admits(false, false));
    }
}
