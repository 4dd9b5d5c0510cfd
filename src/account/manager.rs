/// Account manager: lifecycle and session operations over the repository,
/// the session cache, the password codec and the token issuer.
use crate::{
    account::{
        password::{hash_password, verify_decoy, verify_password},
        token::TokenIssuer,
        AccountSnapshot, RegisterRequest, TokenResponse,
    },
    cache::{AccountKey, SessionCache},
    config::CacheSettings,
    db::account::{Account, AccountChanges, AccountRepository, AccountTransaction, NewAccount, Page, Visibility},
    error::{ServiceError, ServiceResult, UniqueField},
    metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest page `list` will return
pub const MAX_PAGE_SIZE: i64 = 10;

/// Account manager service
pub struct AccountManager {
    repository: Arc<dyn AccountRepository>,
    cache: Arc<dyn SessionCache>,
    tokens: TokenIssuer,
    account_ttl: Duration,
    blacklist_ttl: Duration,
}

impl AccountManager {
    /// Create a new account manager
    pub fn new(
        repository: Arc<dyn AccountRepository>,
        cache: Arc<dyn SessionCache>,
        tokens: TokenIssuer,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            repository,
            cache,
            tokens,
            account_ttl: Duration::from_secs(settings.account_ttl),
            blacklist_ttl: Duration::from_secs(settings.blacklist_ttl),
        }
    }

    /// Create a new account
    pub async fn register(&self, req: RegisterRequest) -> ServiceResult<AccountSnapshot> {
        // Hashed before the write lock is taken
        let password_hash = hash_password(&req.password).await?;

        let mut tx = self.repository.begin().await?;
        let staged = stage_register(tx.as_mut(), req, password_hash).await;
        let account = finish(tx, staged).await?;

        info!("Registered account {} ({})", account.id, account.username);
        metrics::record_account_event("registered");

        Ok(AccountSnapshot::from(account))
    }

    /// Fetch one account, consulting the id-keyed cache first
    pub async fn get(&self, id: i64, visibility: Visibility) -> ServiceResult<AccountSnapshot> {
        let key = AccountKey::Id(id);

        if let Some(snapshot) = self.cached(&key).await {
            if visibility.admits(snapshot.is_active, snapshot.is_deleted) {
                return Ok(snapshot);
            }
        }

        let account = self
            .repository
            .find_by_id(id, visibility)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

        let snapshot = AccountSnapshot::from(account);
        self.populate(&key, &snapshot).await;

        Ok(snapshot)
    }

    /// Page through accounts in id order. Never cached.
    pub async fn list(
        &self,
        page: Page,
        visibility: Visibility,
    ) -> ServiceResult<Vec<AccountSnapshot>> {
        if page.skip < 0 {
            return Err(ServiceError::Validation(
                "skip must be greater than or equal to 0".to_string(),
            ));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page.limit) {
            return Err(ServiceError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let accounts = self.repository.list(page, visibility).await?;
        Ok(accounts.into_iter().map(AccountSnapshot::from).collect())
    }

    /// Apply a partial update
    pub async fn update(&self, id: i64, changes: AccountChanges) -> ServiceResult<AccountSnapshot> {
        let changes = normalize_state(changes);

        let mut tx = self.repository.begin().await?;
        let staged = stage_update(tx.as_mut(), id, &changes).await;
        let (previous, updated) = finish(tx, staged).await?;

        self.evict(&previous, Some(&updated)).await;

        info!("Updated account {}", updated.id);
        metrics::record_account_event("updated");

        Ok(AccountSnapshot::from(updated))
    }

    /// Permanently remove an account
    pub async fn delete(&self, id: i64) -> ServiceResult<()> {
        let mut tx = self.repository.begin().await?;
        let staged = stage_delete(tx.as_mut(), id).await;
        let purged = finish(tx, staged).await?;

        self.evict(&purged, None).await;

        info!("Deleted account {} ({})", purged.id, purged.username);
        metrics::record_account_event("deleted");

        Ok(())
    }

    /// Resolve a bearer token to the account it was issued for
    pub async fn authenticate(&self, token: &str) -> ServiceResult<AccountSnapshot> {
        if self.cache.is_blacklisted(token).await? {
            debug!("Rejected blacklisted token");
            return Err(ServiceError::TokenBlacklisted);
        }

        let claims = self.tokens.decode(token)?;
        let issued_to = claims.id;
        let username = claims
            .sub
            .filter(|sub| !sub.is_empty())
            .ok_or(ServiceError::InvalidCredentials)?;

        // A reused username must not inherit tokens issued to a removed account
        let usable = |id: i64, is_active: bool, is_deleted: bool| {
            is_active && !is_deleted && issued_to.map_or(true, |issued| issued == id)
        };

        let key = AccountKey::Username(username.clone());
        if let Some(snapshot) = self.cached(&key).await {
            if usable(snapshot.id, snapshot.is_active, snapshot.is_deleted) {
                return Ok(snapshot);
            }
        }

        // Absent, inactive, deleted and replaced all look the same to the caller
        let account = self
            .repository
            .find_by_username(&username)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

        let snapshot = AccountSnapshot::from(account);
        if !usable(snapshot.id, snapshot.is_active, snapshot.is_deleted) {
            if issued_to.is_some_and(|issued| issued != snapshot.id) {
                warn!("Token for account {:?} presented for account {}", issued_to, snapshot.id);
            }
            return Err(ServiceError::NotFound("User not found".to_string()));
        }

        self.populate(&key, &snapshot).await;

        Ok(snapshot)
    }

    /// Check credentials and issue an access token
    pub async fn login(&self, username: &str, password: &str) -> ServiceResult<TokenResponse> {
        let Some(account) = self.repository.find_by_username(username).await? else {
            verify_decoy(password).await?;
            warn!("Login failed: unknown username");
            metrics::record_login("invalid_credentials");
            return Err(ServiceError::InvalidCredentials);
        };

        if !verify_password(password, &account.password_hash).await? {
            warn!("Login failed: wrong password for account {}", account.id);
            metrics::record_login("invalid_credentials");
            return Err(ServiceError::InvalidCredentials);
        }

        if !account.is_active || account.is_deleted {
            warn!("Login refused for unavailable account {}", account.id);
            metrics::record_login("unavailable");
            return Err(ServiceError::NotFound("User not found".to_string()));
        }

        let token = self.tokens.issue(&account.username, account.id)?;

        info!("Account {} logged in", account.id);
        metrics::record_login("success");

        Ok(TokenResponse::bearer(token))
    }

    /// Revoke a token. Accepts any string, including malformed tokens.
    pub async fn logout(&self, token: &str) -> ServiceResult<()> {
        let ttl = self
            .tokens
            .remaining_lifetime(token)
            .unwrap_or(self.blacklist_ttl);

        self.cache.blacklist(token, ttl).await?;

        debug!("Token blacklisted for {}s", ttl.as_secs());
        metrics::record_account_event("logout");

        Ok(())
    }

    /// Cache lookup that degrades to a miss when the cache is unavailable
    async fn cached(&self, key: &AccountKey) -> Option<AccountSnapshot> {
        match self.cache.get_account(key).await {
            Ok(Some(snapshot)) => {
                debug!("Cache hit for {:?}", key);
                metrics::record_cache_access(key.kind(), true);
                Some(snapshot)
            }
            Ok(None) => {
                debug!("Cache miss for {:?}", key);
                metrics::record_cache_access(key.kind(), false);
                None
            }
            Err(e) => {
                warn!("Cache read failed for {:?}: {}", key, e);
                None
            }
        }
    }

    async fn populate(&self, key: &AccountKey, snapshot: &AccountSnapshot) {
        if let Err(e) = self.cache.set_account(key, snapshot, self.account_ttl).await {
            warn!("Cache write failed for {:?}: {}", key, e);
        }
    }

    /// Drop every cached snapshot that may describe this account
    async fn evict(&self, previous: &Account, current: Option<&Account>) {
        let mut keys = vec![
            AccountKey::Id(previous.id),
            AccountKey::Username(previous.username.clone()),
        ];
        if let Some(current) = current.filter(|c| c.username != previous.username) {
            keys.push(AccountKey::Username(current.username.clone()));
        }

        for key in &keys {
            if let Err(e) = self.cache.evict_account(key).await {
                warn!("Cache eviction failed for {:?}: {}", key, e);
            }
        }
    }
}

async fn stage_register(
    tx: &mut dyn AccountTransaction,
    req: RegisterRequest,
    password_hash: String,
) -> ServiceResult<Account> {
    if let Some(existing) = tx
        .find_conflicts(None, Some(req.email.as_str()), Some(req.username.as_str()))
        .await?
    {
        return Err(ServiceError::AlreadyExists(conflicting_field(
            &existing,
            Some(req.email.as_str()),
        )));
    }

    let new_account = NewAccount {
        username: req.username,
        email: req.email,
        password_hash,
    };

    // A concurrent insert can still win the race after the check above
    tx.insert(new_account).await.map_err(|e| match e {
        ServiceError::UniquenessViolation(msg) => {
            warn!("Registration lost a uniqueness race: {}", msg);
            ServiceError::AlreadyExists(violated_field(&msg))
        }
        other => other,
    })
}

async fn stage_update(
    tx: &mut dyn AccountTransaction,
    id: i64,
    changes: &AccountChanges,
) -> ServiceResult<(Account, Account)> {
    let current = tx
        .find_by_id(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

    let new_email = changes.email.as_deref().filter(|email| *email != current.email);
    let new_username = changes
        .username
        .as_deref()
        .filter(|username| *username != current.username);

    if new_email.is_some() || new_username.is_some() {
        if let Some(existing) = tx.find_conflicts(Some(id), new_email, new_username).await? {
            return Err(ServiceError::AlreadyExists(conflicting_field(
                &existing, new_email,
            )));
        }
    }

    // The conflict check above passed, so a violation here is a concurrent write
    let updated = tx.apply_update(&current, changes).await.map_err(|e| match e {
        ServiceError::UniquenessViolation(msg) => {
            warn!("Update of account {} lost a uniqueness race: {}", id, msg);
            ServiceError::InconsistentState(
                "Account changed concurrently, please retry".to_string(),
            )
        }
        other => other,
    })?;

    Ok((current, updated))
}

async fn stage_delete(tx: &mut dyn AccountTransaction, id: i64) -> ServiceResult<Account> {
    let account = tx
        .find_by_id(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

    tx.purge(&account).await?;

    Ok(account)
}

/// Commit on success, roll back on failure
async fn finish<T>(tx: Box<dyn AccountTransaction>, staged: ServiceResult<T>) -> ServiceResult<T> {
    match staged {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Transaction rollback failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}

/// An account may not be both active and deleted.
/// Deleting deactivates; activating restores; deletion wins when both are set.
fn normalize_state(mut changes: AccountChanges) -> AccountChanges {
    if changes.is_deleted == Some(true) {
        changes.is_active = Some(false);
    } else if changes.is_active == Some(true) {
        changes.is_deleted = Some(false);
    }
    changes
}

/// Which field of `existing` collides with the request
fn conflicting_field(existing: &Account, email: Option<&str>) -> UniqueField {
    if email == Some(existing.email.as_str()) {
        UniqueField::Email
    } else {
        UniqueField::Username
    }
}

/// Field named by a storage constraint message
/// (`UNIQUE constraint failed: accounts.email`)
fn violated_field(message: &str) -> UniqueField {
    if message.contains("email") {
        UniqueField::Email
    } else {
        UniqueField::Username
    }
}
