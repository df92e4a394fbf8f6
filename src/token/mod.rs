//! Access/refresh token service.
//!
//! Both tokens of a pair are minted with the same `iat`; that shared second
//! is the session correlation key. Refresh tokens are tracked in an
//! outstanding table and rotated on use; access tokens are stateless until a
//! session is revoked, at which point a synthetic `session_{user}_{iat}`
//! blacklist entry kills them before their `exp`.

pub mod repo;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

pub const DEFAULT_ACCESS_LIFETIME_MINUTES: i64 = 30;
pub const DEFAULT_REFRESH_LIFETIME_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
}

/// A freshly minted access/refresh pair sharing one `iat`.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub iat: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is invalid or expired")]
    Invalid,
    #[error("token has been revoked")]
    Revoked,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Synthetic blacklist key binding an access token to its mint second.
#[must_use]
pub fn session_jti(user_id: Uuid, iat: i64) -> String {
    format!("session_{user_id}_{iat}")
}

pub struct TokenService {
    secret: SecretString,
    access_lifetime: Duration,
    refresh_lifetime: Duration,
}

impl TokenService {
    #[must_use]
    pub fn new(secret: SecretString, access_minutes: i64, refresh_days: i64) -> Self {
        Self {
            secret,
            access_lifetime: Duration::minutes(access_minutes),
            refresh_lifetime: Duration::days(refresh_days),
        }
    }

    #[must_use]
    pub fn access_lifetime(&self) -> Duration {
        self.access_lifetime
    }

    /// Mints a new pair and records the refresh token as outstanding.
    ///
    /// # Errors
    /// Returns error if signing or the database insert fails.
    pub async fn issue_pair(&self, pool: &PgPool, user_id: Uuid) -> Result<TokenPair> {
        let mut tx = pool.begin().await.context("begin token issuance")?;
        let pair = self.issue_pair_in(&mut tx, user_id).await?;
        tx.commit().await.context("commit token issuance")?;
        Ok(pair)
    }

    /// Rotates a refresh token: the presented token must be outstanding and
    /// not blacklisted; it is blacklisted and a new pair is minted, all in
    /// one transaction so two rotations of the same token cannot both win.
    ///
    /// # Errors
    /// `TokenError::Invalid` for malformed/expired/unknown tokens,
    /// `TokenError::Revoked` for already-rotated ones.
    pub async fn refresh(&self, pool: &PgPool, refresh_token: &str) -> Result<TokenPair, TokenError> {
        let claims = self
            .decode(refresh_token)
            .map_err(|_| TokenError::Invalid)?;
        if claims.token_type != TokenType::Refresh {
            return Err(TokenError::Invalid);
        }

        let mut tx = pool
            .begin()
            .await
            .context("begin token rotation")
            .map_err(TokenError::Internal)?;

        let outstanding = repo::lock_outstanding_by_jti(&mut tx, &claims.jti)
            .await
            .map_err(TokenError::Internal)?
            .ok_or(TokenError::Invalid)?;
        if outstanding.user_id != claims.sub {
            return Err(TokenError::Invalid);
        }
        if repo::is_refresh_blacklisted(&mut tx, outstanding.id)
            .await
            .map_err(TokenError::Internal)?
        {
            return Err(TokenError::Revoked);
        }

        repo::blacklist_refresh(&mut tx, outstanding.id)
            .await
            .map_err(TokenError::Internal)?;
        let pair = self
            .issue_pair_in(&mut tx, claims.sub)
            .await
            .map_err(TokenError::Internal)?;

        tx.commit()
            .await
            .context("commit token rotation")
            .map_err(TokenError::Internal)?;
        Ok(pair)
    }

    /// Validates an access token: signature, expiry, type, and absence from
    /// the session blacklist.
    ///
    /// # Errors
    /// `TokenError::Invalid` or `TokenError::Revoked`.
    pub async fn validate_access(&self, pool: &PgPool, token: &str) -> Result<Claims, TokenError> {
        let claims = self.decode(token).map_err(|_| TokenError::Invalid)?;
        if claims.token_type != TokenType::Access {
            return Err(TokenError::Invalid);
        }
        let revoked = repo::is_session_blacklisted(pool, &session_jti(claims.sub, claims.iat))
            .await
            .map_err(TokenError::Internal)?;
        if revoked {
            return Err(TokenError::Revoked);
        }
        Ok(claims)
    }

    /// Best-effort blacklisting of a presented refresh token on logout.
    pub async fn blacklist_presented_refresh(&self, pool: &PgPool, refresh_token: &str) {
        let Ok(claims) = self.decode(refresh_token) else {
            return;
        };
        if claims.token_type != TokenType::Refresh {
            return;
        }
        if let Err(err) = repo::blacklist_by_jti(pool, &claims.jti).await {
            tracing::error!("Failed to blacklist refresh token on logout: {err}");
        }
    }

    async fn issue_pair_in(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
    ) -> Result<TokenPair> {
        let now = Utc::now();
        let iat = now.timestamp();
        let refresh_jti = Uuid::new_v4().to_string();
        let refresh_expires = expires_at(iat, self.refresh_lifetime)?;

        let access = self.sign(Claims {
            sub: user_id,
            jti: Uuid::new_v4().to_string(),
            iat,
            exp: iat + self.access_lifetime.num_seconds(),
            token_type: TokenType::Access,
        })?;
        let refresh = self.sign(Claims {
            sub: user_id,
            jti: refresh_jti.clone(),
            iat,
            exp: iat + self.refresh_lifetime.num_seconds(),
            token_type: TokenType::Refresh,
        })?;

        let created_at =
            DateTime::<Utc>::from_timestamp(iat, 0).context("token iat out of range")?;
        repo::insert_outstanding(tx, user_id, &refresh_jti, created_at, refresh_expires).await?;

        Ok(TokenPair {
            access,
            refresh,
            iat,
        })
    }

    fn sign(&self, claims: Claims) -> Result<String> {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.expose_secret().as_bytes()),
        )
        .context("failed to sign token")
    }

    fn decode(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.expose_secret().as_bytes()),
            &validation,
        )
        .context("failed to decode token")?;
        Ok(data.claims)
    }
}

fn expires_at(iat: i64, lifetime: Duration) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(iat + lifetime.num_seconds(), 0)
        .context("token expiry out of range")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(
            SecretString::from("test-secret"),
            DEFAULT_ACCESS_LIFETIME_MINUTES,
            DEFAULT_REFRESH_LIFETIME_DAYS,
        )
    }

    #[test]
    fn session_jti_format() {
        let user_id = Uuid::nil();
        assert_eq!(
            session_jti(user_id, 1000),
            format!("session_{user_id}_1000")
        );
    }

    #[test]
    fn sign_and_decode_round_trip() {
        let service = service();
        let user_id = Uuid::new_v4();
        let iat = Utc::now().timestamp();
        let token = service
            .sign(Claims {
                sub: user_id,
                jti: "jti-1".to_string(),
                iat,
                exp: iat + 60,
                token_type: TokenType::Access,
            })
            .expect("sign");

        let claims = service.decode(&token).expect("decode");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.jti, "jti-1");
        assert_eq!(claims.iat, iat);
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn decode_rejects_expired() {
        let service = service();
        let iat = Utc::now().timestamp() - 120;
        let token = service
            .sign(Claims {
                sub: Uuid::new_v4(),
                jti: "jti-2".to_string(),
                iat,
                exp: iat + 60,
                token_type: TokenType::Access,
            })
            .expect("sign");

        assert!(service.decode(&token).is_err());
    }

    #[test]
    fn decode_rejects_foreign_secret() {
        let service = service();
        let other = TokenService::new(
            SecretString::from("other-secret"),
            DEFAULT_ACCESS_LIFETIME_MINUTES,
            DEFAULT_REFRESH_LIFETIME_DAYS,
        );
        let iat = Utc::now().timestamp();
        let token = service
            .sign(Claims {
                sub: Uuid::new_v4(),
                jti: "jti-3".to_string(),
                iat,
                exp: iat + 60,
                token_type: TokenType::Refresh,
            })
            .expect("sign");

        assert!(other.decode(&token).is_err());
    }

    #[test]
    fn token_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TokenType::Access).expect("json"),
            "\"access\""
        );
        assert_eq!(
            serde_json::to_string(&TokenType::Refresh).expect("json"),
            "\"refresh\""
        );
    }
}
