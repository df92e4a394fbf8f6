//! Barcode issuance engine.
//!
//! Issues the artifact returned by `POST /generate_barcode`. The whole
//! decision runs inside one transaction holding `FOR UPDATE` locks on the
//! caller's settings rows, so concurrent issuances for the same user
//! serialize and the pull-pool writeback stays consistent with the pick.
//!
//! Policy:
//! - Staff never issues; accounts without a known role never issue.
//! - School accounts with pull mode enabled get automatic selection:
//!   stickiness (most recent transaction within 10 minutes) wins, otherwise
//!   a uniform random pick from the gender-filtered pool, excluding barcodes
//!   used by anyone within the last 5 minutes.
//! - The `user` role is locked to its identification barcode, which is
//!   re-minted on every issue.
//! - Non-owned barcodes issue only when shared dynamic.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use chrono_tz::Tz;
use rand::Rng;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use utoipa::ToSchema;

use crate::users::{Role, UserRecord};

use super::limits::{self, LimitDecision};
use super::models::{Barcode, BarcodeType, IDENTIFICATION_VALUE_DIGITS, PullSetting};
use super::repo;

const STICKINESS_SECONDS: i64 = 10 * 60;
const POOL_EXCLUSION_SECONDS: i64 = 5 * 60;
const DEDUPE_SECONDS: i64 = 5 * 60;
const MINT_ATTEMPTS: usize = 50;
const LOCAL_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// A successfully issued barcode, ready for presentation.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IssuedBarcode {
    pub barcode_type: BarcodeType,
    pub barcode: String,
    pub message: String,
}

/// Engine-level outcome. Rejections are part of the legacy wire contract:
/// they travel as HTTP 200 with `status: "error"`.
#[derive(Debug)]
pub enum IssueOutcome {
    Issued(IssuedBarcode),
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct IssuanceEngine {
    tz: Tz,
}

impl IssuanceEngine {
    #[must_use]
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Issues a barcode for the caller.
    ///
    /// # Errors
    /// `IssueError::PermissionDenied` for staff or role-less accounts and
    /// for non-shareable selections; `IssueError::Internal` on database or
    /// minting failures.
    pub async fn issue(&self, pool: &PgPool, user: &UserRecord) -> Result<IssueOutcome, IssueError> {
        let role = match user.primary_role() {
            Some(Role::Staff) | None => return Err(IssueError::PermissionDenied),
            Some(role) => role,
        };

        let mut tx = pool
            .begin()
            .await
            .context("begin barcode issuance")
            .map_err(IssueError::Internal)?;

        let outcome = self.issue_in(&mut tx, user, role).await?;

        // Rejections commit too: the pull-selection writeback and the
        // ensure-rows for settings are kept even when a limit denies the
        // issue itself.
        tx.commit()
            .await
            .context("commit barcode issuance")
            .map_err(IssueError::Internal)?;
        Ok(outcome)
    }

    async fn issue_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user: &UserRecord,
        role: Role,
    ) -> Result<IssueOutcome, IssueError> {
        let settings = repo::settings_for_update(tx, user.id)
            .await
            .map_err(IssueError::Internal)?;
        let pull = repo::pull_settings_for_update(tx, user.id)
            .await
            .map_err(IssueError::Internal)?;

        // Selection. The user role bypasses it entirely: always the owner's
        // identification barcode, re-minted below.
        if role == Role::User {
            repo::clear_profile_association(tx, user.id)
                .await
                .map_err(IssueError::Internal)?;
            return self.issue_identification(tx, user).await;
        }

        let selected = if pull.pull_setting == PullSetting::Enable {
            self.pull_select(tx, user, pull.gender_setting).await?
        } else {
            match settings.barcode_id {
                Some(barcode_id) => repo::get_barcode(tx, barcode_id)
                    .await
                    .map_err(IssueError::Internal)?,
                None => None,
            }
        };

        let Some(barcode) = selected else {
            return Ok(IssueOutcome::Rejected("No barcode selected.".to_string()));
        };

        // Only shared dynamic barcodes may be issued by non-owners.
        if barcode.owner_id != user.id
            && !(barcode.barcode_type == BarcodeType::Dynamic && barcode.share_with_others)
        {
            return Ok(IssueOutcome::Rejected("Permission Denied.".to_string()));
        }

        match barcode.barcode_type {
            BarcodeType::Identification => self.issue_identification(tx, user).await,
            BarcodeType::Dynamic => self.issue_dynamic(tx, user, &barcode).await,
            BarcodeType::Others => self.issue_others(tx, user, &barcode).await,
        }
    }

    async fn pull_select(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user: &UserRecord,
        gender: super::models::Gender,
    ) -> Result<Option<Barcode>, IssueError> {
        // Stickiness beats freshness: reuse the barcode of the most recent
        // transaction inside the window if it still exists.
        if let Some(sticky) = repo::sticky_barcode(tx, user.id, STICKINESS_SECONDS)
            .await
            .map_err(IssueError::Internal)?
        {
            return Ok(Some(sticky));
        }

        let pool_entries = repo::pull_pool(tx, user.id, gender, POOL_EXCLUSION_SECONDS)
            .await
            .map_err(IssueError::Internal)?;
        if pool_entries.is_empty() {
            return Ok(None);
        }

        let index = rand::thread_rng().gen_range(0..pool_entries.len());
        let picked = pool_entries
            .into_iter()
            .nth(index)
            .ok_or_else(|| IssueError::Internal(anyhow!("pull pool pick out of bounds")))?;
        repo::set_selected_barcode(tx, user.id, Some(picked.id))
            .await
            .map_err(IssueError::Internal)?;
        Ok(Some(picked))
    }

    async fn issue_identification(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user: &UserRecord,
    ) -> Result<IssueOutcome, IssueError> {
        repo::delete_identification_barcodes(tx, user.id)
            .await
            .map_err(IssueError::Internal)?;

        let mut minted = None;
        for _ in 0..MINT_ATTEMPTS {
            let value = random_numeric(IDENTIFICATION_VALUE_DIGITS);
            if let Some(barcode) =
                repo::try_insert_barcode(tx, user.id, BarcodeType::Identification, &value, false)
                    .await
                    .map_err(IssueError::Internal)?
            {
                minted = Some(barcode);
                break;
            }
        }
        let barcode = minted.ok_or_else(|| {
            IssueError::Internal(anyhow!("failed to mint a unique identification value"))
        })?;

        repo::set_selected_barcode(tx, user.id, Some(barcode.id))
            .await
            .map_err(IssueError::Internal)?;

        if let LimitDecision::Denied(message) = limits::check_all(tx, self.tz, barcode.id)
            .await
            .map_err(IssueError::Internal)?
        {
            return Ok(IssueOutcome::Rejected(message));
        }
        self.touch_usage(tx, user, &barcode).await?;

        Ok(IssueOutcome::Issued(IssuedBarcode {
            barcode_type: BarcodeType::Identification,
            barcode: barcode.value,
            message: "Identification barcode issued.".to_string(),
        }))
    }

    async fn issue_dynamic(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user: &UserRecord,
        barcode: &Barcode,
    ) -> Result<IssueOutcome, IssueError> {
        if let LimitDecision::Denied(message) = limits::check_all(tx, self.tz, barcode.id)
            .await
            .map_err(IssueError::Internal)?
        {
            return Ok(IssueOutcome::Rejected(message));
        }
        self.touch_usage(tx, user, barcode).await?;

        let timestamp = Utc::now()
            .with_timezone(&self.tz)
            .format(LOCAL_TIMESTAMP_FORMAT);
        let value = format!("{timestamp}{}", barcode.value);
        let tail = &value[value.len().saturating_sub(4)..];

        Ok(IssueOutcome::Issued(IssuedBarcode {
            barcode_type: BarcodeType::Dynamic,
            message: format!("Dynamic: …{tail}"),
            barcode: value,
        }))
    }

    async fn issue_others(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user: &UserRecord,
        barcode: &Barcode,
    ) -> Result<IssueOutcome, IssueError> {
        if let LimitDecision::Denied(message) = limits::check_all(tx, self.tz, barcode.id)
            .await
            .map_err(IssueError::Internal)?
        {
            return Ok(IssueOutcome::Rejected(message));
        }
        self.touch_usage(tx, user, barcode).await?;

        Ok(IssueOutcome::Issued(IssuedBarcode {
            barcode_type: BarcodeType::Others,
            barcode: barcode.value.clone(),
            message: "Barcode issued.".to_string(),
        }))
    }

    /// Usage counter protocol: a transaction for the same `(user, barcode)`
    /// within the dedupe window skips both the counter advance and the
    /// ledger insert. Identification barcodes are logged but never counted.
    async fn touch_usage(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user: &UserRecord,
        barcode: &Barcode,
    ) -> Result<(), IssueError> {
        if repo::has_recent_transaction(tx, user.id, barcode.id, DEDUPE_SECONDS)
            .await
            .map_err(IssueError::Internal)?
        {
            return Ok(());
        }
        if barcode.barcode_type != BarcodeType::Identification {
            repo::advance_usage(tx, barcode.id)
                .await
                .map_err(IssueError::Internal)?;
        }
        repo::insert_transaction(tx, user.id, barcode.id)
            .await
            .map_err(IssueError::Internal)?;
        Ok(())
    }
}

fn random_numeric(digits: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..digits)
        .map(|_| char::from(b'0' + rng.gen_range(0..10)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barcode::models::DYNAMIC_VALUE_DIGITS;
    use chrono::TimeZone;
    use chrono_tz::America::Los_Angeles;

    #[test]
    fn random_numeric_has_requested_length_and_charset() {
        for _ in 0..32 {
            let value = random_numeric(IDENTIFICATION_VALUE_DIGITS);
            assert_eq!(value.len(), IDENTIFICATION_VALUE_DIGITS);
            assert!(value.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn dynamic_values_are_14_digits() {
        let value = random_numeric(DYNAMIC_VALUE_DIGITS);
        assert_eq!(value.len(), DYNAMIC_VALUE_DIGITS);
    }

    #[test]
    fn local_timestamp_format_is_14_chars() {
        let moment = Utc.with_ymd_and_hms(2024, 6, 15, 20, 5, 9).unwrap();
        let formatted = moment
            .with_timezone(&Los_Angeles)
            .format(LOCAL_TIMESTAMP_FORMAT)
            .to_string();
        assert_eq!(formatted.len(), 14);
        // 20:05:09 UTC is 13:05:09 PDT.
        assert_eq!(formatted, "20240615130509");
    }

    #[test]
    fn composed_dynamic_value_keeps_suffix() {
        let stored = "12345678901234";
        let timestamp = "20240615130509";
        let value = format!("{timestamp}{stored}");
        assert_eq!(value.len(), 28);
        assert!(value.ends_with(stored));
        let tail = &value[value.len() - 4..];
        assert_eq!(tail, "1234");
    }

    #[test]
    fn issue_error_messages() {
        assert_eq!(IssueError::PermissionDenied.to_string(), "permission denied");
    }
}
