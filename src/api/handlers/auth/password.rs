//! Password hashing and verification.
//!
//! New hashes are Argon2id in PHC format. Verification also accepts legacy
//! PBKDF2-SHA256 hashes so migrated accounts keep working; those accounts
//! are re-hashed on their next successful login.

use anyhow::{Context, Result};
use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::rngs::OsRng;

/// Hash a password with Argon2id.
///
/// # Errors
/// Returns error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC hash.
///
/// Unparsable hashes verify as false rather than erroring, so a corrupt
/// stored hash reads as bad credentials instead of a server fault.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    match parsed.algorithm.as_str() {
        alg if alg.starts_with("argon2") => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        alg if alg.starts_with("pbkdf2") => Pbkdf2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        _ => false,
    }
}

/// Whether a stored hash predates the preferred algorithm.
#[must_use]
pub fn needs_rehash(stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash)
        .map(|parsed| !parsed.algorithm.as_str().starts_with("argon2"))
        .unwrap_or(true)
}

/// Upgrade a legacy hash in place after a successful verification.
pub async fn rehash_if_needed(pool: &sqlx::PgPool, user_id: uuid::Uuid, password: &str) {
    let Ok(new_hash) = hash_password(password) else {
        return;
    };
    let query = "UPDATE users SET password_hash = $1 WHERE id = $2";
    if let Err(err) = sqlx::query(query)
        .bind(&new_hash)
        .bind(user_id)
        .execute(pool)
        .await
        .context("failed to upgrade password hash")
    {
        tracing::error!("Password rehash failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argon2_round_trip() {
        let hash = hash_password("hunter2").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn legacy_pbkdf2_hash_verifies() {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Pbkdf2
            .hash_password("hunter2".as_bytes(), &salt)
            .expect("hash")
            .to_string();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(needs_rehash(&hash));
    }

    #[test]
    fn fresh_argon2_does_not_need_rehash() {
        let hash = hash_password("hunter2").expect("hash");
        assert!(!needs_rehash(&hash));
    }

    #[test]
    fn garbage_hash_is_just_wrong_credentials() {
        assert!(!verify_password("hunter2", "not-a-phc-hash"));
        assert!(needs_rehash("not-a-phc-hash"));
    }
}
