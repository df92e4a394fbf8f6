//! Request and response types for the auth and barcode surfaces.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse,
};

use crate::barcode::limits::UsageStats;
use crate::barcode::models::{BarcodeType, Gender, PullSetting};

#[derive(Debug, Serialize, ToSchema)]
pub struct ChallengeResponse {
    /// Base64 nonce to embed in the encrypted login payload.
    pub nonce: String,
    pub kid: String,
    /// PEM public key to encrypt the login payload with.
    pub public_key: String,
    pub ttl_s: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    /// Base64 RSA-OAEP ciphertext of `{"nonce": ..., "password": ...}`.
    pub password: String,
}

/// Plaintext carried inside the login ciphertext.
#[derive(Debug, Deserialize)]
pub struct EncryptedCredentials {
    pub nonce: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    #[must_use]
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefreshRequest {
    /// Refresh token; falls back to the refresh cookie when omitted.
    pub refresh: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub name: String,
    pub information_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProfileResponse {
    pub name: String,
    pub information_id: String,
    pub profile_uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_profile_img_base64: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserInfoResponse {
    pub username: String,
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileResponse>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ProfileUpdateRequest {
    pub name: Option<String>,
    pub information_id: Option<String>,
    pub user_profile_img_base64: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PasskeyRegisterOptionsResponse {
    pub registration_id: String,
    #[schema(value_type = Object)]
    pub options: CreationChallengeResponse,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PasskeyRegisterVerifyRequest {
    pub registration_id: String,
    #[schema(value_type = Object)]
    pub credential: RegisterPublicKeyCredential,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PasskeyAuthOptionsRequest {
    /// Restricts the credential list to this account when present.
    pub username: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PasskeyAuthOptionsResponse {
    pub authentication_id: String,
    #[schema(value_type = Object)]
    pub options: RequestChallengeResponse,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PasskeyAuthVerifyRequest {
    pub authentication_id: String,
    #[schema(value_type = Object)]
    pub credential: PublicKeyCredential,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeviceSessionResponse {
    pub token_id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub device_name: String,
    pub browser: String,
    pub os: String,
    pub device_type: String,
    pub is_current: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GenerateBarcodeResponse {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barcode_type: Option<BarcodeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
}

impl GenerateBarcodeResponse {
    #[must_use]
    pub fn success(barcode_type: BarcodeType, barcode: String, message: String) -> Self {
        Self {
            status: "success".to_string(),
            message,
            barcode_type: Some(barcode_type),
            barcode: Some(barcode),
        }
    }

    #[must_use]
    pub fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            message,
            barcode_type: None,
            barcode: None,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BarcodeView {
    pub barcode_uuid: Uuid,
    pub barcode_type: BarcodeType,
    pub value: String,
    pub share_with_others: bool,
    pub time_created: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BarcodeSettingsView {
    pub barcode_uuid: Option<Uuid>,
    pub server_verification: bool,
    pub associate_user_profile_with_barcode: bool,
    pub pull_setting: PullSetting,
    pub gender_setting: Gender,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DashboardResponse {
    pub settings: BarcodeSettingsView,
    pub owned: Vec<BarcodeView>,
    pub shared: Vec<BarcodeView>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DashboardCreateRequest {
    pub share_with_others: Option<bool>,
    pub daily_usage_limit: Option<i64>,
    pub total_usage_limit: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DashboardSettingsRequest {
    /// Selects a barcode when present.
    pub barcode_uuid: Option<Uuid>,
    pub server_verification: Option<bool>,
    pub associate_user_profile_with_barcode: Option<bool>,
    pub pull_setting: Option<PullSetting>,
    pub gender_setting: Option<Gender>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DashboardPatchRequest {
    pub barcode_uuid: Uuid,
    pub share_with_others: Option<bool>,
    pub daily_usage_limit: Option<i64>,
    pub total_usage_limit: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DashboardDeleteRequest {
    pub barcode_uuid: Uuid,
}
