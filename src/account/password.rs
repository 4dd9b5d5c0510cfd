/// Password hashing with Argon2id
use crate::error::{ServiceError, ServiceResult};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use tokio::sync::OnceCell;

/// Hash checked when no stored hash exists, so unknown usernames cost
/// the same Argon2 work as known ones
static DECOY_HASH: OnceCell<String> = OnceCell::const_new();

/// Hash a password with a fresh random salt.
///
/// Runs on the blocking pool; Argon2 is deliberately slow.
pub async fn hash_password(password: &str) -> ServiceResult<String> {
    let password = password.to_string();

    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ServiceError::Internal(format!("Password hashing failed: {}", e)))
    })
    .await
    .map_err(|e| ServiceError::Internal(format!("Task join error: {}", e)))?
}

/// Verify a password against a stored hash.
///
/// A malformed hash verifies as `false` instead of failing.
pub async fn verify_password(password: &str, hash: &str) -> ServiceResult<bool> {
    let password = password.to_string();
    let hash = hash.to_string();

    tokio::task::spawn_blocking(move || {
        let parsed = match PasswordHash::new(&hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Stored password hash is malformed: {}", e);
                return false;
            }
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
    .await
    .map_err(|e| ServiceError::Internal(format!("Task join error: {}", e)))
}

/// Spend one verification against a throwaway hash. Always fails.
pub async fn verify_decoy(password: &str) -> ServiceResult<()> {
    let decoy = DECOY_HASH
        .get_or_try_init(|| hash_password("accountd-decoy-password"))
        .await?;
    verify_password(password, decoy).await?;
    Ok(())
}
