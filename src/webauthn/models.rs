use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, postgres::PgRow};
use uuid::Uuid;

/// The single stored passkey for a user. `credential_id` is the
/// base64url-encoded raw credential id; `passkey_data` is the serialized
/// verifier-side credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasskeyCredential {
    pub user_id: Uuid,
    pub credential_id: String,
    pub passkey_data: Vec<u8>,
    pub sign_count: i64,
    pub attestation_format: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PasskeyCredential {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            credential_id: row.try_get("credential_id")?,
            passkey_data: row.try_get("passkey_data")?,
            sign_count: row.try_get("sign_count")?,
            attestation_format: row.try_get("attestation_format")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
