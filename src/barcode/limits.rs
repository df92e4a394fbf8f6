//! Usage limit checks against the local-timezone day window.
//!
//! Daily counts come from the transaction ledger; total counts from the
//! usage row. A limit of zero means unlimited. Identification barcodes never
//! accumulate usage, so their checks always pass.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use utoipa::ToSchema;
use uuid::Uuid;

use super::repo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Denied(String),
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UsageStats {
    pub daily_used: i64,
    pub daily_limit: i64,
    pub total_used: i64,
    pub total_limit: i64,
    pub daily_remaining: Option<i64>,
    pub total_remaining: Option<i64>,
}

/// The UTC bounds of the local day containing `now`.
///
/// The window is `[start_of_local_day, +24h)`. On DST transition days the
/// window is still 24 hours long, matching how the counter resets behave.
#[must_use]
pub fn local_day_bounds(tz: Tz, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_date = now.with_timezone(&tz).date_naive();
    let midnight = local_date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let start = tz
        .from_local_datetime(&midnight)
        .earliest()
        .map_or(now, |start| start.with_timezone(&Utc));
    (start, start + Duration::hours(24))
}

/// Checks the daily cap for a barcode.
///
/// # Errors
/// Returns error if the ledger query fails.
pub async fn check_daily(
    tx: &mut Transaction<'_, Postgres>,
    tz: Tz,
    barcode_id: Uuid,
    daily_limit: i64,
) -> Result<LimitDecision> {
    if daily_limit <= 0 {
        return Ok(LimitDecision::Allowed);
    }
    let (start, end) = local_day_bounds(tz, Utc::now());
    let used = repo::count_transactions_between(tx, barcode_id, start, end).await?;
    if used >= daily_limit {
        return Ok(LimitDecision::Denied(format!(
            "Daily usage limit of {daily_limit} scans has been reached"
        )));
    }
    Ok(LimitDecision::Allowed)
}

/// Checks the lifetime cap for a barcode.
///
/// # Errors
/// Returns error if the usage query fails.
pub async fn check_total(
    tx: &mut Transaction<'_, Postgres>,
    barcode_id: Uuid,
) -> Result<LimitDecision> {
    let Some(usage) = repo::usage_row(tx, barcode_id).await? else {
        return Ok(LimitDecision::Allowed);
    };
    if usage.total_usage_limit > 0 && usage.total_usage >= usage.total_usage_limit {
        return Ok(LimitDecision::Denied(format!(
            "Total usage limit of {} scans has been reached",
            usage.total_usage_limit
        )));
    }
    Ok(LimitDecision::Allowed)
}

/// Daily check first, then total.
///
/// # Errors
/// Returns error if either underlying query fails.
pub async fn check_all(
    tx: &mut Transaction<'_, Postgres>,
    tz: Tz,
    barcode_id: Uuid,
) -> Result<LimitDecision> {
    let daily_limit = repo::usage_row(tx, barcode_id)
        .await?
        .map_or(0, |usage| usage.daily_usage_limit);
    match check_daily(tx, tz, barcode_id, daily_limit).await? {
        LimitDecision::Allowed => check_total(tx, barcode_id).await,
        denied @ LimitDecision::Denied(_) => Ok(denied),
    }
}

/// Usage statistics for dashboard display.
///
/// # Errors
/// Returns error if the underlying queries fail.
pub async fn stats(pool: &PgPool, tz: Tz, barcode_id: Uuid) -> Result<UsageStats> {
    let mut tx = pool.begin().await.context("begin usage stats")?;
    let usage = repo::usage_row(&mut tx, barcode_id).await?;
    let (start, end) = local_day_bounds(tz, Utc::now());
    let daily_used = repo::count_transactions_between(&mut tx, barcode_id, start, end).await?;
    tx.commit().await.context("commit usage stats")?;

    let (total_used, total_limit, daily_limit) = usage.map_or((0, 0, 0), |usage| {
        (
            usage.total_usage,
            usage.total_usage_limit,
            usage.daily_usage_limit,
        )
    });

    Ok(UsageStats {
        daily_used,
        daily_limit,
        total_used,
        total_limit,
        daily_remaining: (daily_limit > 0).then(|| (daily_limit - daily_used).max(0)),
        total_remaining: (total_limit > 0).then(|| (total_limit - total_used).max(0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;

    #[test]
    fn day_bounds_cover_24_hours() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 20, 0, 0).unwrap();
        let (start, end) = local_day_bounds(Los_Angeles, now);
        assert_eq!(end - start, Duration::hours(24));
        assert!(start <= now && now < end);
    }

    #[test]
    fn day_starts_at_local_midnight() {
        // 2024-06-15 20:00 UTC is 13:00 PDT; local midnight is 07:00 UTC.
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 20, 0, 0).unwrap();
        let (start, _end) = local_day_bounds(Los_Angeles, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 15, 7, 0, 0).unwrap());
    }

    #[test]
    fn late_utc_evening_is_same_local_day() {
        // 2024-06-16 02:00 UTC is still 2024-06-15 in Los Angeles.
        let now = Utc.with_ymd_and_hms(2024, 6, 16, 2, 0, 0).unwrap();
        let (start, _end) = local_day_bounds(Los_Angeles, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 15, 7, 0, 0).unwrap());
    }

    #[test]
    fn winter_offset_shifts_midnight() {
        // PST is UTC-8, so local midnight lands on 08:00 UTC.
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 20, 0, 0).unwrap();
        let (start, _end) = local_day_bounds(Los_Angeles, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap());
    }

    #[test]
    fn stats_remaining_is_none_when_unlimited() {
        let stats = UsageStats {
            daily_used: 3,
            daily_limit: 0,
            total_used: 10,
            total_limit: 20,
            daily_remaining: None,
            total_remaining: Some(10),
        };
        assert!(stats.daily_remaining.is_none());
        assert_eq!(stats.total_remaining, Some(10));
    }
}
