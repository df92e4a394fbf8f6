//! RSA keypair storage for the login challenge flow.
//!
//! The active keypair is the one advertised to clients alongside a login
//! challenge. Rotation retires the active row but keeps its private material
//! so ciphertexts produced against a just-rotated key still decrypt.

use anyhow::{Context, Result};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, EncodePrivateKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use sqlx::{PgPool, Row};
use tracing::{Instrument, warn};
use uuid::Uuid;

const DEFAULT_KEY_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyStoreError {
    #[error("no active RSA keypair")]
    NoActiveKey,
    #[error("ciphertext did not decrypt under any retained key")]
    DecryptFailed,
}

/// Public half of the advertised keypair.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub kid: Uuid,
    pub public_pem: String,
}

/// Keypair store with an in-memory cache of parsed private keys.
///
/// Key material is immutable once written, so cache entries never need
/// invalidation; rotation only adds rows.
#[derive(Debug, Default)]
pub struct KeyStore {
    private_keys: DashMap<Uuid, RsaPrivateKey>,
}

impl KeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            private_keys: DashMap::new(),
        }
    }

    /// Returns the advertised keypair.
    ///
    /// # Errors
    /// Returns `KeyStoreError::NoActiveKey` if no row is active, or the
    /// underlying database error.
    pub async fn active(&self, pool: &PgPool) -> Result<ActiveKey> {
        let query = "SELECT kid, public_pem FROM rsa_keypairs WHERE is_active LIMIT 1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .fetch_optional(pool)
            .instrument(span)
            .await
            .context("failed to load active keypair")?;

        let row = row.ok_or(KeyStoreError::NoActiveKey)?;
        Ok(ActiveKey {
            kid: row.get("kid"),
            public_pem: row.get("public_pem"),
        })
    }

    /// Decrypts an OAEP-SHA256 ciphertext, trying the active key first and
    /// falling back through every retained private key.
    ///
    /// # Errors
    /// Returns `KeyStoreError::DecryptFailed` when no retained key decrypts
    /// the payload, `NoActiveKey` when the store is empty.
    pub async fn decrypt(&self, pool: &PgPool, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let query = r"
            SELECT kid, private_pem
            FROM rsa_keypairs
            ORDER BY is_active DESC, created_at DESC
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .fetch_all(pool)
            .instrument(span)
            .await
            .context("failed to load retained keypairs")?;

        if rows.is_empty() {
            return Err(KeyStoreError::NoActiveKey.into());
        }

        for row in rows {
            let kid: Uuid = row.get("kid");
            let key = match self.private_for(kid, row.get("private_pem")) {
                Ok(key) => key,
                Err(err) => {
                    warn!("Skipping unparsable keypair {kid}: {err}");
                    continue;
                }
            };
            if let Ok(plaintext) = key.decrypt(Oaep::new::<Sha256>(), ciphertext) {
                return Ok(plaintext);
            }
        }

        Err(KeyStoreError::DecryptFailed.into())
    }

    /// Generates a fresh keypair, activates it, and retires the previous
    /// active row in the same transaction.
    ///
    /// # Errors
    /// Returns error if key generation or the database update fails.
    pub async fn rotate(&self, pool: &PgPool, key_size: usize) -> Result<Uuid> {
        let bits = if key_size == 0 { DEFAULT_KEY_SIZE } else { key_size };
        let private_key =
            RsaPrivateKey::new(&mut OsRng, bits).context("failed to generate RSA keypair")?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .context("failed to encode private key")?
            .to_string();
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .context("failed to encode public key")?;

        let mut tx = pool.begin().await.context("begin key rotation")?;

        let query = "UPDATE rsa_keypairs SET is_active = FALSE, rotated_at = NOW() WHERE is_active";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to retire active keypair")?;

        let query = r"
            INSERT INTO rsa_keypairs (public_pem, private_pem, key_size, is_active)
            VALUES ($1, $2, $3, TRUE)
            RETURNING kid
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&public_pem)
            .bind(&private_pem)
            .bind(i32::try_from(bits).unwrap_or(2048))
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert keypair")?;

        tx.commit().await.context("commit key rotation")?;

        self.private_keys.insert(row.get("kid"), private_key);
        Ok(row.get("kid"))
    }

    fn private_for(&self, kid: Uuid, pem: String) -> Result<RsaPrivateKey> {
        if let Some(cached) = self.private_keys.get(&kid) {
            return Ok(cached.clone());
        }
        let key =
            RsaPrivateKey::from_pkcs8_pem(&pem).context("failed to parse stored private key")?;
        self.private_keys.insert(kid, key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::Pkcs1v15Encrypt;

    fn small_keypair() -> RsaPrivateKey {
        // 512 bits keeps test key generation fast; production sizes are
        // enforced by the schema check constraint.
        RsaPrivateKey::new(&mut OsRng, 512).expect("keypair")
    }

    #[test]
    fn oaep_round_trip() {
        let private_key = small_keypair();
        let public_key = RsaPublicKey::from(&private_key);

        let ciphertext = public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), b"hello")
            .expect("encrypt");
        let plaintext = private_key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .expect("decrypt");
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn oaep_rejects_wrong_padding() {
        let private_key = small_keypair();
        let public_key = RsaPublicKey::from(&private_key);

        let ciphertext = public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, b"hello")
            .expect("encrypt");
        assert!(private_key.decrypt(Oaep::new::<Sha256>(), &ciphertext).is_err());
    }

    #[test]
    fn pem_round_trip_parses() {
        let private_key = small_keypair();
        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode")
            .to_string();

        let store = KeyStore::new();
        let parsed = store.private_for(Uuid::new_v4(), pem).expect("parse");
        assert_eq!(parsed, private_key);
    }

    #[test]
    fn private_key_cache_hits_by_kid() {
        let private_key = small_keypair();
        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode")
            .to_string();

        let store = KeyStore::new();
        let kid = Uuid::new_v4();
        store.private_for(kid, pem).expect("parse");
        // Garbage PEM under a cached kid must still resolve from the cache.
        let cached = store.private_for(kid, "not a pem".to_string()).expect("cache");
        assert_eq!(cached, private_key);
    }

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            KeyStoreError::NoActiveKey.to_string(),
            "no active RSA keypair"
        );
        assert_eq!(
            KeyStoreError::DecryptFailed.to_string(),
            "ciphertext did not decrypt under any retained key"
        );
    }
}
