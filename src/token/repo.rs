//! Database helpers for refresh-token bookkeeping and session blacklists.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::Instrument;
use uuid::Uuid;

/// One outstanding (not yet rotated) refresh token.
#[derive(Debug, Clone)]
pub struct OutstandingToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub jti: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn outstanding_from_row(row: &PgRow) -> OutstandingToken {
    OutstandingToken {
        id: row.get("id"),
        user_id: row.get("user_id"),
        jti: row.get("jti"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    }
}

pub(super) async fn insert_outstanding(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    jti: &str,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    let query = r"
        INSERT INTO refresh_tokens_outstanding (user_id, jti, created_at, expires_at)
        VALUES ($1, $2, $3, $4)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(jti)
        .bind(created_at)
        .bind(expires_at)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert outstanding refresh token")?;
    Ok(())
}

/// Locks the outstanding row for the given jti so concurrent rotations of
/// the same refresh token serialize.
pub(super) async fn lock_outstanding_by_jti(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    jti: &str,
) -> Result<Option<OutstandingToken>> {
    let query = r"
        SELECT id, user_id, jti, created_at, expires_at
        FROM refresh_tokens_outstanding
        WHERE jti = $1 AND expires_at > NOW()
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(jti)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to lock outstanding refresh token")?;
    Ok(row.as_ref().map(outstanding_from_row))
}

pub(super) async fn is_refresh_blacklisted(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    token_id: Uuid,
) -> Result<bool> {
    let query = "SELECT 1 FROM refresh_tokens_blacklisted WHERE token_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_id)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to check refresh blacklist")?;
    Ok(row.is_some())
}

pub async fn blacklist_refresh(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    token_id: Uuid,
) -> Result<()> {
    let query = r"
        INSERT INTO refresh_tokens_blacklisted (token_id)
        VALUES ($1)
        ON CONFLICT (token_id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to blacklist refresh token")?;
    Ok(())
}

pub(super) async fn blacklist_by_jti(pool: &PgPool, jti: &str) -> Result<()> {
    let query = r"
        INSERT INTO refresh_tokens_blacklisted (token_id)
        SELECT id FROM refresh_tokens_outstanding WHERE jti = $1
        ON CONFLICT (token_id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(jti)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to blacklist refresh token by jti")?;
    Ok(())
}

pub(super) async fn is_session_blacklisted(pool: &PgPool, session_jti: &str) -> Result<bool> {
    let query = "SELECT 1 FROM access_token_blacklist WHERE jti = $1 AND expires_at > NOW()";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(session_jti)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check session blacklist")?;
    Ok(row.is_some())
}

/// Blacklists the access-token side of a revoked session. The entry expires
/// once the paired access token would have expired anyway.
pub async fn blacklist_access_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    session_jti: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    let query = r"
        INSERT INTO access_token_blacklist (jti, user_id, expires_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (jti) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_jti)
        .bind(user_id)
        .bind(expires_at)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to blacklist access session")?;
    Ok(())
}

/// Lists a user's live refresh tokens, newest first, skipping blacklisted
/// and expired rows.
pub async fn list_outstanding(pool: &PgPool, user_id: Uuid) -> Result<Vec<OutstandingToken>> {
    let query = r"
        SELECT o.id, o.user_id, o.jti, o.created_at, o.expires_at
        FROM refresh_tokens_outstanding o
        LEFT JOIN refresh_tokens_blacklisted b ON b.token_id = o.id
        WHERE o.user_id = $1
          AND o.expires_at > NOW()
          AND b.token_id IS NULL
        ORDER BY o.created_at DESC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list outstanding refresh tokens")?;
    Ok(rows.iter().map(outstanding_from_row).collect())
}

/// Loads one outstanding row by id for the given user, together with its
/// blacklist state.
pub async fn get_outstanding(
    pool: &PgPool,
    user_id: Uuid,
    token_id: Uuid,
) -> Result<Option<(OutstandingToken, bool)>> {
    let query = r"
        SELECT o.id, o.user_id, o.jti, o.created_at, o.expires_at,
               b.token_id IS NOT NULL AS blacklisted
        FROM refresh_tokens_outstanding o
        LEFT JOIN refresh_tokens_blacklisted b ON b.token_id = o.id
        WHERE o.id = $1 AND o.user_id = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_id)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to load outstanding refresh token")?;
    Ok(row.map(|row| {
        let blacklisted: bool = row.get("blacklisted");
        (outstanding_from_row(&row), blacklisted)
    }))
}
