//! Append-only login audit log.
//!
//! Audit writes never fail the request: persistence errors are logged and
//! swallowed. The log doubles as the data source for session/device
//! correlation, which matches audit rows to token mint times.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::{Instrument, error};
use uuid::Uuid;

/// How far an audit row may drift from a token's mint time and still be
/// treated as the same login.
pub(crate) const MATCH_WINDOW_SECONDS: i64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditResult {
    Success,
    Failure,
    Blocked,
}

impl AuditResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
        }
    }
}

/// Fields of a successful audit row needed for device display.
#[derive(Debug, Clone)]
pub struct AuditMatch {
    pub ip: Option<String>,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

/// Record an authentication attempt. Never fails the caller.
pub async fn record(
    pool: &PgPool,
    username: &str,
    ip: Option<&str>,
    user_agent: &str,
    result: AuditResult,
    reason: Option<&str>,
    user_id: Option<Uuid>,
) {
    let query = r"
        INSERT INTO login_audit_log (username, ip, user_agent, result, reason, success, user_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    if let Err(err) = sqlx::query(query)
        .bind(username)
        .bind(ip)
        .bind(user_agent)
        .bind(result.as_str())
        .bind(reason)
        .bind(result == AuditResult::Success)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
    {
        error!("Failed to write login audit record: {err}");
    }
}

/// The successful audit row best matching a token minted at `minted_at`:
/// prefer a row inside `[minted_at - 5s, minted_at + 5s]`, else the latest
/// one at or before `minted_at`. The fuzziness absorbs the fact that audit
/// and token writes are not co-transactional.
pub async fn best_match(
    pool: &PgPool,
    user_id: Uuid,
    minted_at: DateTime<Utc>,
) -> Result<Option<AuditMatch>> {
    let window = Duration::seconds(MATCH_WINDOW_SECONDS);
    let query = r"
        SELECT ip, user_agent, created_at
        FROM login_audit_log
        WHERE user_id = $1
          AND success
          AND created_at BETWEEN $2 AND $3
        ORDER BY created_at DESC
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(minted_at - window)
        .bind(minted_at + window)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to match audit window")?;

    if let Some(row) = row {
        return Ok(Some(AuditMatch {
            ip: row.get("ip"),
            user_agent: row.get("user_agent"),
            created_at: row.get("created_at"),
        }));
    }

    let query = r"
        SELECT ip, user_agent, created_at
        FROM login_audit_log
        WHERE user_id = $1
          AND success
          AND created_at <= $2
        ORDER BY created_at DESC
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(minted_at)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to match latest audit")?;

    Ok(row.map(|row| AuditMatch {
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        created_at: row.get("created_at"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_result_text_values() {
        assert_eq!(AuditResult::Success.as_str(), "success");
        assert_eq!(AuditResult::Failure.as_str(), "failure");
        assert_eq!(AuditResult::Blocked.as_str(), "blocked");
    }
}
