use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, postgres::PgRow};
use utoipa::ToSchema;
use uuid::Uuid;

/// Identification values are minted fresh per issue; dynamic values are
/// stored and prefixed with a local timestamp at issuance.
pub const IDENTIFICATION_VALUE_DIGITS: usize = 28;
pub const DYNAMIC_VALUE_DIGITS: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BarcodeType {
    Identification,
    Dynamic,
    Others,
}

impl BarcodeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identification => "identification",
            Self::Dynamic => "dynamic",
            Self::Others => "others",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "identification" => Some(Self::Identification),
            "dynamic" => Some(Self::Dynamic),
            "others" => Some(Self::Others),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Unknow,
}

impl Gender {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Unknow => "unknow",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "male" => Some(Self::Male),
            "female" => Some(Self::Female),
            "unknow" => Some(Self::Unknow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PullSetting {
    Enable,
    Disable,
}

impl PullSetting {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enable" => Some(Self::Enable),
            "disable" => Some(Self::Disable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barcode {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub time_created: DateTime<Utc>,
    pub barcode_uuid: Uuid,
    pub share_with_others: bool,
    pub barcode_type: BarcodeType,
    pub value: String,
}

impl<'r> FromRow<'r, PgRow> for Barcode {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let type_text: String = row.try_get("barcode_type")?;
        let barcode_type = BarcodeType::parse(&type_text).ok_or_else(|| {
            sqlx::Error::Decode(format!("unknown barcode type: {type_text}").into())
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            time_created: row.try_get("time_created")?,
            barcode_uuid: row.try_get("barcode_uuid")?,
            share_with_others: row.try_get("share_with_others")?,
            barcode_type,
            value: row.try_get("value")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarcodeUsage {
    pub barcode_id: Uuid,
    pub total_usage: i64,
    pub total_usage_limit: i64,
    pub daily_usage_limit: i64,
    pub last_used: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for BarcodeUsage {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            barcode_id: row.try_get("barcode_id")?,
            total_usage: row.try_get("total_usage")?,
            total_usage_limit: row.try_get("total_usage_limit")?,
            daily_usage_limit: row.try_get("daily_usage_limit")?,
            last_used: row.try_get("last_used")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BarcodeSettings {
    pub user_id: Uuid,
    pub barcode_id: Option<Uuid>,
    pub server_verification: bool,
    pub associate_user_profile_with_barcode: bool,
}

impl<'r> FromRow<'r, PgRow> for BarcodeSettings {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            barcode_id: row.try_get("barcode_id")?,
            server_verification: row.try_get("server_verification")?,
            associate_user_profile_with_barcode: row
                .try_get("associate_user_profile_with_barcode")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BarcodePullSettings {
    pub user_id: Uuid,
    pub pull_setting: PullSetting,
    pub gender_setting: Gender,
}

impl<'r> FromRow<'r, PgRow> for BarcodePullSettings {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let pull_text: String = row.try_get("pull_setting")?;
        let gender_text: String = row.try_get("gender_setting")?;
        Ok(Self {
            user_id: row.try_get("user_id")?,
            pull_setting: PullSetting::parse(&pull_text).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown pull setting: {pull_text}").into())
            })?,
            gender_setting: Gender::parse(&gender_text).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown gender setting: {gender_text}").into())
            })?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barcode_type_round_trips_through_text() {
        for barcode_type in [
            BarcodeType::Identification,
            BarcodeType::Dynamic,
            BarcodeType::Others,
        ] {
            assert_eq!(BarcodeType::parse(barcode_type.as_str()), Some(barcode_type));
        }
        assert_eq!(BarcodeType::parse("qr"), None);
    }

    #[test]
    fn gender_round_trips_through_text() {
        for gender in [Gender::Male, Gender::Female, Gender::Unknow] {
            assert_eq!(Gender::parse(gender.as_str()), Some(gender));
        }
        assert_eq!(Gender::parse("other"), None);
    }

    #[test]
    fn pull_setting_round_trips_through_text() {
        for setting in [PullSetting::Enable, PullSetting::Disable] {
            assert_eq!(PullSetting::parse(setting.as_str()), Some(setting));
        }
        assert_eq!(PullSetting::parse("on"), None);
    }

    #[test]
    fn barcode_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BarcodeType::Identification).expect("json"),
            "\"identification\""
        );
    }
}
