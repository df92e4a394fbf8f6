//! Database helpers for barcodes, settings, usage counters, and the
//! transaction ledger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::Instrument;
use uuid::Uuid;

use super::models::{
    Barcode, BarcodePullSettings, BarcodeSettings, BarcodeType, BarcodeUsage, Gender,
};

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Loads the caller's settings row under `FOR UPDATE`, creating it first if
/// missing. The row lock serializes concurrent issuances for one user.
pub async fn settings_for_update(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<BarcodeSettings> {
    let query = r"
        INSERT INTO user_barcode_settings (user_id)
        VALUES ($1)
        ON CONFLICT (user_id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to ensure barcode settings")?;

    let query = "SELECT * FROM user_barcode_settings WHERE user_id = $1 FOR UPDATE";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, BarcodeSettings>(query)
        .bind(user_id)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
        .context("failed to lock barcode settings")
}

/// Same protocol for the pull settings row.
pub async fn pull_settings_for_update(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<BarcodePullSettings> {
    let query = r"
        INSERT INTO user_barcode_pull_settings (user_id)
        VALUES ($1)
        ON CONFLICT (user_id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to ensure pull settings")?;

    let query = "SELECT * FROM user_barcode_pull_settings WHERE user_id = $1 FOR UPDATE";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, BarcodePullSettings>(query)
        .bind(user_id)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
        .context("failed to lock pull settings")
}

pub async fn set_selected_barcode(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    barcode_id: Option<Uuid>,
) -> Result<()> {
    let query = "UPDATE user_barcode_settings SET barcode_id = $1 WHERE user_id = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(barcode_id)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to update selected barcode")?;
    Ok(())
}

pub async fn clear_profile_association(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<()> {
    let query = r"
        UPDATE user_barcode_settings
        SET associate_user_profile_with_barcode = FALSE
        WHERE user_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to clear profile association")?;
    Ok(())
}

pub async fn get_barcode(
    tx: &mut Transaction<'_, Postgres>,
    barcode_id: Uuid,
) -> Result<Option<Barcode>> {
    let query = "SELECT * FROM barcodes WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, Barcode>(query)
        .bind(barcode_id)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to fetch barcode")
}

pub async fn get_barcode_by_id(pool: &PgPool, barcode_id: Uuid) -> Result<Option<Barcode>> {
    let query = "SELECT * FROM barcodes WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, Barcode>(query)
        .bind(barcode_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch barcode")
}

pub async fn get_barcode_by_uuid(pool: &PgPool, barcode_uuid: Uuid) -> Result<Option<Barcode>> {
    let query = "SELECT * FROM barcodes WHERE barcode_uuid = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, Barcode>(query)
        .bind(barcode_uuid)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch barcode by uuid")
}

/// The barcode used by the caller's most recent transaction inside the
/// stickiness window, if that barcode still exists.
pub async fn sticky_barcode(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    window_seconds: i64,
) -> Result<Option<Barcode>> {
    let query = r"
        SELECT b.*
        FROM transactions t
        JOIN barcodes b ON b.id = t.barcode_id
        WHERE t.user_id = $1
          AND t.time_created > NOW() - ($2 * INTERVAL '1 second')
        ORDER BY t.time_created DESC
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, Barcode>(query)
        .bind(user_id)
        .bind(window_seconds)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to look up sticky barcode")
}

/// The pull pool: the caller's own barcodes plus shared dynamic ones, with
/// an attached profile matching the gender filter, excluding any barcode
/// used (by anyone) inside the exclusion window.
pub async fn pull_pool(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    gender: Gender,
    exclusion_seconds: i64,
) -> Result<Vec<Barcode>> {
    let query = r"
        SELECT b.*
        FROM barcodes b
        JOIN barcode_user_profiles p ON p.barcode_id = b.id
        LEFT JOIN barcode_usage u ON u.barcode_id = b.id
        WHERE (b.owner_id = $1 OR (b.barcode_type = 'dynamic' AND b.share_with_others))
          AND p.gender = $2
          AND (u.last_used IS NULL OR u.last_used < NOW() - ($3 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, Barcode>(query)
        .bind(user_id)
        .bind(gender.as_str())
        .bind(exclusion_seconds)
        .fetch_all(&mut **tx)
        .instrument(span)
        .await
        .context("failed to build pull pool")
}

pub async fn delete_identification_barcodes(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<()> {
    let query = "DELETE FROM barcodes WHERE owner_id = $1 AND barcode_type = 'identification'";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to delete identification barcodes")?;
    Ok(())
}

/// Inserts a barcode; `Ok(None)` signals a value collision so the caller
/// can retry with a fresh value.
pub async fn try_insert_barcode(
    tx: &mut Transaction<'_, Postgres>,
    owner_id: Uuid,
    barcode_type: BarcodeType,
    value: &str,
    share_with_others: bool,
) -> Result<Option<Barcode>> {
    let query = r"
        INSERT INTO barcodes (owner_id, barcode_type, value, share_with_others)
        VALUES ($1, $2, $3, $4)
        RETURNING *
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let result = sqlx::query_as::<_, Barcode>(query)
        .bind(owner_id)
        .bind(barcode_type.as_str())
        .bind(value)
        .bind(share_with_others)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await;

    match result {
        Ok(barcode) => Ok(Some(barcode)),
        Err(err) if is_unique_violation(&err) => Ok(None),
        Err(err) => Err(err).context("failed to insert barcode"),
    }
}

pub async fn usage_row(
    tx: &mut Transaction<'_, Postgres>,
    barcode_id: Uuid,
) -> Result<Option<BarcodeUsage>> {
    let query = "SELECT * FROM barcode_usage WHERE barcode_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, BarcodeUsage>(query)
        .bind(barcode_id)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to fetch barcode usage")
}

/// Single-statement counter advance; inserts the row on first use.
pub async fn advance_usage(tx: &mut Transaction<'_, Postgres>, barcode_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE barcode_usage
        SET total_usage = total_usage + 1, last_used = NOW()
        WHERE barcode_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(barcode_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to advance barcode usage")?;

    if result.rows_affected() == 0 {
        let query = r"
            INSERT INTO barcode_usage (barcode_id, total_usage, last_used)
            VALUES ($1, 1, NOW())
            ON CONFLICT (barcode_id) DO UPDATE
            SET total_usage = barcode_usage.total_usage + 1, last_used = NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(barcode_id)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to initialize barcode usage")?;
    }
    Ok(())
}

pub async fn has_recent_transaction(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    barcode_id: Uuid,
    window_seconds: i64,
) -> Result<bool> {
    let query = r"
        SELECT 1
        FROM transactions
        WHERE user_id = $1
          AND barcode_id = $2
          AND time_created > NOW() - ($3 * INTERVAL '1 second')
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
        .bind(barcode_id)
        .bind(window_seconds)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to check recent transactions")?;
    Ok(row.is_some())
}

pub async fn insert_transaction(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    barcode_id: Uuid,
) -> Result<()> {
    let query = "INSERT INTO transactions (user_id, barcode_id) VALUES ($1, $2)";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(barcode_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert transaction")?;
    Ok(())
}

pub async fn count_transactions_between(
    tx: &mut Transaction<'_, Postgres>,
    barcode_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<i64> {
    let query = r"
        SELECT COUNT(*)
        FROM transactions
        WHERE barcode_id = $1
          AND time_created >= $2
          AND time_created < $3
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(barcode_id)
        .bind(start)
        .bind(end)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
        .context("failed to count transactions")?;
    Ok(row.get(0))
}

pub async fn list_owned_barcodes(pool: &PgPool, user_id: Uuid) -> Result<Vec<Barcode>> {
    let query = "SELECT * FROM barcodes WHERE owner_id = $1 ORDER BY time_created DESC";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, Barcode>(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list owned barcodes")
}

pub async fn list_shared_barcodes(pool: &PgPool, user_id: Uuid) -> Result<Vec<Barcode>> {
    let query = r"
        SELECT *
        FROM barcodes
        WHERE barcode_type = 'dynamic'
          AND share_with_others
          AND owner_id <> $1
        ORDER BY time_created DESC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, Barcode>(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list shared barcodes")
}

pub async fn update_share_flag(
    pool: &PgPool,
    owner_id: Uuid,
    barcode_uuid: Uuid,
    share_with_others: bool,
) -> Result<bool> {
    let query = r"
        UPDATE barcodes
        SET share_with_others = $1
        WHERE barcode_uuid = $2 AND owner_id = $3
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(share_with_others)
        .bind(barcode_uuid)
        .bind(owner_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update share flag")?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_usage_limits(
    pool: &PgPool,
    barcode_id: Uuid,
    daily_usage_limit: Option<i64>,
    total_usage_limit: Option<i64>,
) -> Result<()> {
    let query = r"
        INSERT INTO barcode_usage (barcode_id, daily_usage_limit, total_usage_limit)
        VALUES ($1, COALESCE($2, 0), COALESCE($3, 0))
        ON CONFLICT (barcode_id) DO UPDATE
        SET daily_usage_limit = COALESCE($2, barcode_usage.daily_usage_limit),
            total_usage_limit = COALESCE($3, barcode_usage.total_usage_limit)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(barcode_id)
        .bind(daily_usage_limit)
        .bind(total_usage_limit)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update usage limits")?;
    Ok(())
}

/// Deletes an owned, non-identification barcode. Returns whether a row was
/// removed.
pub async fn delete_owned_barcode(
    pool: &PgPool,
    owner_id: Uuid,
    barcode_uuid: Uuid,
) -> Result<bool> {
    let query = r"
        DELETE FROM barcodes
        WHERE barcode_uuid = $1
          AND owner_id = $2
          AND barcode_type <> 'identification'
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(barcode_uuid)
        .bind(owner_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete barcode")?;
    Ok(result.rows_affected() > 0)
}

pub async fn settings_view(pool: &PgPool, user_id: Uuid) -> Result<Option<BarcodeSettings>> {
    let query = "SELECT * FROM user_barcode_settings WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, BarcodeSettings>(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch barcode settings")
}

pub async fn pull_settings_view(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<BarcodePullSettings>> {
    let query = "SELECT * FROM user_barcode_pull_settings WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, BarcodePullSettings>(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch pull settings")
}

/// Applies settings changes outside the issuance path (dashboard PUT).
pub async fn update_settings(
    pool: &PgPool,
    user_id: Uuid,
    barcode_id: Option<Option<Uuid>>,
    server_verification: Option<bool>,
    associate_profile: Option<bool>,
) -> Result<()> {
    let query = r"
        INSERT INTO user_barcode_settings (user_id)
        VALUES ($1)
        ON CONFLICT (user_id) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to ensure barcode settings")?;

    if let Some(barcode_id) = barcode_id {
        let query = "UPDATE user_barcode_settings SET barcode_id = $1 WHERE user_id = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(barcode_id)
            .bind(user_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to update selected barcode")?;
    }
    if let Some(server_verification) = server_verification {
        let query = "UPDATE user_barcode_settings SET server_verification = $1 WHERE user_id = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(server_verification)
            .bind(user_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to update server verification")?;
    }
    if let Some(associate_profile) = associate_profile {
        let query = r"
            UPDATE user_barcode_settings
            SET associate_user_profile_with_barcode = $1
            WHERE user_id = $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(associate_profile)
            .bind(user_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to update profile association")?;
    }
    Ok(())
}

pub async fn update_pull_settings(
    pool: &PgPool,
    user_id: Uuid,
    pull_setting: Option<super::models::PullSetting>,
    gender_setting: Option<Gender>,
) -> Result<()> {
    let query = r"
        INSERT INTO user_barcode_pull_settings (user_id, pull_setting, gender_setting)
        VALUES ($1, COALESCE($2, 'disable'), COALESCE($3, 'unknow'))
        ON CONFLICT (user_id) DO UPDATE
        SET pull_setting = COALESCE($2, user_barcode_pull_settings.pull_setting),
            gender_setting = COALESCE($3, user_barcode_pull_settings.gender_setting)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(pull_setting.map(super::models::PullSetting::as_str))
        .bind(gender_setting.map(Gender::as_str))
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update pull settings")?;
    Ok(())
}
