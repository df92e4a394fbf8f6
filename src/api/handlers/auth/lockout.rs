//! Failed-attempt tracking and account lockout windows.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;

/// Whether the account is currently inside a lockout window.
///
/// # Errors
/// Returns error if the database query fails.
pub async fn is_blocked(pool: &PgPool, username: &str) -> Result<bool> {
    let query = r"
        SELECT locked_until
        FROM failed_login_attempts
        WHERE username = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(username)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to read lockout state")?;

    let locked_until: Option<DateTime<Utc>> = match row {
        Some(row) => row.get("locked_until"),
        None => None,
    };
    Ok(locked_until.is_some_and(|until| until > Utc::now()))
}

/// Count a failed attempt; reaching the cap starts the lockout window.
///
/// # Errors
/// Returns error if the database query fails.
pub async fn record_failure(
    pool: &PgPool,
    username: &str,
    ip: Option<&str>,
    max_attempts: i32,
    lockout_minutes: i64,
) -> Result<()> {
    let query = r"
        INSERT INTO failed_login_attempts (username, ip, attempt_count, last_attempt)
        VALUES ($1, $2, 1, NOW())
        ON CONFLICT (username) DO UPDATE
        SET attempt_count = LEAST(failed_login_attempts.attempt_count + 1, $3),
            ip = EXCLUDED.ip,
            last_attempt = NOW(),
            locked_until = CASE
                WHEN failed_login_attempts.attempt_count + 1 >= $3
                THEN NOW() + ($4 * INTERVAL '1 minute')
                ELSE failed_login_attempts.locked_until
            END
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(username)
        .bind(ip)
        .bind(max_attempts)
        .bind(lockout_minutes)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to record login failure")?;
    Ok(())
}

/// Zero the counters after a successful login.
///
/// # Errors
/// Returns error if the database query fails.
pub async fn reset(pool: &PgPool, username: &str, ip: Option<&str>) -> Result<()> {
    let query = r"
        INSERT INTO failed_login_attempts (username, ip, attempt_count, last_attempt)
        VALUES ($1, $2, 0, NOW())
        ON CONFLICT (username) DO UPDATE
        SET attempt_count = 0,
            locked_until = NULL,
            ip = EXCLUDED.ip,
            last_attempt = NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(username)
        .bind(ip)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to reset login failures")?;
    Ok(())
}
