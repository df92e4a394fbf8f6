use crate::webauthn::models::PasskeyCredential;
use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::Instrument;
use uuid::Uuid;

pub struct PasskeyRepo;

impl PasskeyRepo {
    /// Replaces the user's passkey. The user id is the primary key, so a
    /// re-registration overwrites any prior credential.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn replace_for_user(
        pool: &PgPool,
        user_id: Uuid,
        credential_id: &str,
        passkey_data: &[u8],
        sign_count: i64,
        attestation_format: &str,
    ) -> Result<()> {
        let query = r"
            INSERT INTO passkeys (user_id, credential_id, passkey_data, sign_count, attestation_format)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
            SET credential_id = EXCLUDED.credential_id,
                passkey_data = EXCLUDED.passkey_data,
                sign_count = EXCLUDED.sign_count,
                attestation_format = EXCLUDED.attestation_format,
                created_at = NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(credential_id)
            .bind(passkey_data)
            .bind(sign_count)
            .bind(attestation_format)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to store passkey")?;
        Ok(())
    }

    /// Fetches the user's passkey, if any.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn get_for_user(pool: &PgPool, user_id: Uuid) -> Result<Option<PasskeyCredential>> {
        let query = "SELECT * FROM passkeys WHERE user_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, PasskeyCredential>(query)
            .bind(user_id)
            .fetch_optional(pool)
            .instrument(span)
            .await
            .context("failed to fetch passkey")
    }

    /// Advances the sign counter and stores the updated serialized
    /// credential after a successful authentication.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn record_authentication(
        pool: &PgPool,
        user_id: Uuid,
        passkey_data: &[u8],
        sign_count: i64,
    ) -> Result<()> {
        let query = r"
            UPDATE passkeys
            SET passkey_data = $1, sign_count = $2
            WHERE user_id = $3
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(passkey_data)
            .bind(sign_count)
            .bind(user_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to record passkey authentication")?;
        Ok(())
    }
}
