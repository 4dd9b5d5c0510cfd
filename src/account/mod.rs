/// Account management system
///
/// Handles registration, lookup, updates, deletion, login and token-based
/// sessions for user accounts.

mod manager;
pub mod password;
pub mod token;

pub use manager::AccountManager;

use crate::db::account::{Account, AccountChanges};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Outward projection of an account. Also the cached snapshot format.
/// Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Account> for AccountSnapshot {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            username: account.username.clone(),
            email: account.email.clone(),
            is_active: account.is_active,
            is_deleted: account.is_deleted,
            created_at: account.created_at,
        }
    }
}

impl From<Account> for AccountSnapshot {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            username: account.username,
            email: account.email,
            is_active: account.is_active,
            is_deleted: account.is_deleted,
            created_at: account.created_at,
        }
    }
}

/// Account creation request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 50))]
    pub username: String,
    #[validate(length(min = 6, max = 24))]
    pub password: String,
    #[validate(email, length(min = 6, max = 128))]
    pub email: String,
}

/// Partial update request; absent fields keep their stored value
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateAccountRequest {
    #[validate(length(min = 3, max = 50))]
    pub username: Option<String>,
    #[validate(email, length(min = 6, max = 128))]
    pub email: Option<String>,
    pub is_active: Option<bool>,
    pub is_deleted: Option<bool>,
}

impl From<UpdateAccountRequest> for AccountChanges {
    fn from(req: UpdateAccountRequest) -> Self {
        Self {
            username: req.username,
            email: req.email,
            is_active: req.is_active,
            is_deleted: req.is_deleted,
        }
    }
}

/// Login form (`application/x-www-form-urlencoded`).
/// Only presence is checked; wrong values must fail as bad credentials.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoginForm {
    #[validate(length(min = 1))]
    pub username: String,
    #[validate(length(min = 1))]
    pub password: String,
}

/// Issued access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

impl TokenResponse {
    pub fn bearer(access_token: String) -> Self {
        Self {
            access_token,
            token_type: "bearer".to_string(),
        }
    }
}

/// Listing query parameters
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ListQuery {
    #[serde(default)]
    #[validate(range(min = 0))]
    pub skip: i64,
    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 10))]
    pub limit: i64,
    #[serde(default)]
    pub show_deleted: bool,
    #[serde(default = "default_true")]
    pub show_active: bool,
}

/// Single-account lookup filters
#[derive(Debug, Clone, Deserialize)]
pub struct VisibilityQuery {
    #[serde(default)]
    pub show_deleted: bool,
    #[serde(default = "default_true")]
    pub show_active: bool,
}

fn default_limit() -> i64 {
    10
}

fn default_true() -> bool {
    true
}
