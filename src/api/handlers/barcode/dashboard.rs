//! `/barcode_dashboard`: settings and barcode management for School
//! accounts. Every method is role-gated; plain users receive 403.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
};
use anyhow::{Context, Result, anyhow};
use rand::Rng;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::barcode::limits;
use crate::barcode::models::{Barcode, BarcodeType, DYNAMIC_VALUE_DIGITS};
use crate::barcode::repo;
use crate::users::{Role, UserRecord};

use super::super::auth::challenge::throttled;
use super::super::auth::rate_limit::{Decision, Scope};
use super::super::auth::session::{Authenticated, authenticate, enforce_csrf};
use super::super::auth::state::AuthState;
use super::super::auth::types::{
    BarcodeSettingsView, BarcodeView, DashboardCreateRequest, DashboardDeleteRequest,
    DashboardPatchRequest, DashboardResponse, DashboardSettingsRequest, MessageResponse,
};

const MINT_ATTEMPTS: usize = 50;

async fn gate(
    headers: &HeaderMap,
    method: &Method,
    pool: &PgPool,
    auth_state: &AuthState,
) -> Result<Authenticated, (StatusCode, String)> {
    let authed = authenticate(headers, pool, auth_state).await?;
    if authed.user.primary_role() != Some(Role::School) {
        return Err((StatusCode::FORBIDDEN, "Permission Denied.".to_string()));
    }
    enforce_csrf(headers, method, authed.transport)?;
    if let Decision::Limited { retry_after_secs } = auth_state
        .rate_limiter()
        .check(Scope::BarcodeManagement, &authed.user.id.to_string())
    {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            format!("Rate limited, retry after {retry_after_secs}s"),
        ));
    }
    Ok(authed)
}

async fn barcode_view(
    pool: &PgPool,
    auth_state: &AuthState,
    barcode: Barcode,
    with_usage: bool,
) -> BarcodeView {
    let usage = if with_usage {
        match limits::stats(pool, auth_state.config().timezone(), barcode.id).await {
            Ok(stats) => Some(stats),
            Err(err) => {
                error!("Failed to load usage stats: {err}");
                None
            }
        }
    } else {
        None
    };
    BarcodeView {
        barcode_uuid: barcode.barcode_uuid,
        barcode_type: barcode.barcode_type,
        value: barcode.value,
        share_with_others: barcode.share_with_others,
        time_created: barcode.time_created,
        usage,
    }
}

#[utoipa::path(
    get,
    path = "/barcode_dashboard",
    responses(
        (status = 200, description = "Settings and barcodes", body = DashboardResponse),
        (status = 401, description = "Unauthorized", body = String),
        (status = 403, description = "School role required", body = String)
    ),
    tag = "barcode"
)]
pub async fn dashboard(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let authed = match gate(&headers, &method, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };

    match dashboard_view(&pool, &auth_state, &authed.user).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => {
            error!("Failed to build dashboard: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

async fn dashboard_view(
    pool: &PgPool,
    auth_state: &AuthState,
    user: &UserRecord,
) -> Result<DashboardResponse> {
    let settings = repo::settings_view(pool, user.id).await?;
    let pull = repo::pull_settings_view(pool, user.id).await?;

    let selected_uuid = match settings.as_ref().and_then(|settings| settings.barcode_id) {
        Some(barcode_id) => repo::get_barcode_by_id(pool, barcode_id)
            .await?
            .map(|barcode| barcode.barcode_uuid),
        None => None,
    };

    let mut owned = Vec::new();
    for barcode in repo::list_owned_barcodes(pool, user.id).await? {
        owned.push(barcode_view(pool, auth_state, barcode, true).await);
    }
    let mut shared = Vec::new();
    for barcode in repo::list_shared_barcodes(pool, user.id).await? {
        shared.push(barcode_view(pool, auth_state, barcode, false).await);
    }

    let (server_verification, associate) = settings
        .map(|settings| {
            (
                settings.server_verification,
                settings.associate_user_profile_with_barcode,
            )
        })
        .unwrap_or_default();
    let (pull_setting, gender_setting) = pull
        .map(|pull| (pull.pull_setting, pull.gender_setting))
        .unwrap_or((
            crate::barcode::models::PullSetting::Disable,
            crate::barcode::models::Gender::Unknow,
        ));

    Ok(DashboardResponse {
        settings: BarcodeSettingsView {
            barcode_uuid: selected_uuid,
            server_verification,
            associate_user_profile_with_barcode: associate,
            pull_setting,
            gender_setting,
        },
        owned,
        shared,
    })
}

#[utoipa::path(
    post,
    path = "/barcode_dashboard",
    request_body = DashboardCreateRequest,
    responses(
        (status = 201, description = "Dynamic barcode created", body = BarcodeView),
        (status = 401, description = "Unauthorized", body = String),
        (status = 403, description = "School role required", body = String)
    ),
    tag = "barcode"
)]
pub async fn create_barcode(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<DashboardCreateRequest>>,
) -> impl IntoResponse {
    let authed = match gate(&headers, &method, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };
    let request = payload.map(|Json(request)| request).unwrap_or(DashboardCreateRequest {
        share_with_others: None,
        daily_usage_limit: None,
        total_usage_limit: None,
    });
    if request.daily_usage_limit.is_some_and(|limit| limit < 0)
        || request.total_usage_limit.is_some_and(|limit| limit < 0)
    {
        return (
            StatusCode::BAD_REQUEST,
            "Limits must be non-negative".to_string(),
        )
            .into_response();
    }

    match mint_dynamic(&pool, &authed.user, &request).await {
        Ok(barcode) => {
            let view = barcode_view(&pool, &auth_state, barcode, true).await;
            (StatusCode::CREATED, Json(view)).into_response()
        }
        Err(err) => {
            error!("Failed to create dynamic barcode: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

async fn mint_dynamic(
    pool: &PgPool,
    user: &UserRecord,
    request: &DashboardCreateRequest,
) -> Result<Barcode> {
    let mut tx = pool.begin().await.context("begin barcode creation")?;

    let mut minted = None;
    for _ in 0..MINT_ATTEMPTS {
        let value = random_numeric(DYNAMIC_VALUE_DIGITS);
        if let Some(barcode) = repo::try_insert_barcode(
            &mut tx,
            user.id,
            BarcodeType::Dynamic,
            &value,
            request.share_with_others.unwrap_or(false),
        )
        .await?
        {
            minted = Some(barcode);
            break;
        }
    }
    let barcode = minted.ok_or_else(|| anyhow!("failed to mint a unique dynamic value"))?;
    tx.commit().await.context("commit barcode creation")?;

    if request.daily_usage_limit.is_some() || request.total_usage_limit.is_some() {
        repo::update_usage_limits(
            pool,
            barcode.id,
            request.daily_usage_limit,
            request.total_usage_limit,
        )
        .await?;
    }
    Ok(barcode)
}

#[utoipa::path(
    put,
    path = "/barcode_dashboard",
    request_body = DashboardSettingsRequest,
    responses(
        (status = 200, description = "Settings updated", body = MessageResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 403, description = "School role required or barcode not usable", body = String)
    ),
    tag = "barcode"
)]
pub async fn update_settings(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<DashboardSettingsRequest>>,
) -> impl IntoResponse {
    let authed = match gate(&headers, &method, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    // Selecting a barcode revalidates ownership: non-owned selections must
    // be shared dynamic barcodes.
    let barcode_id = match request.barcode_uuid {
        Some(barcode_uuid) => match repo::get_barcode_by_uuid(&pool, barcode_uuid).await {
            Ok(Some(barcode)) => {
                if barcode.owner_id != authed.user.id
                    && !(barcode.barcode_type == BarcodeType::Dynamic && barcode.share_with_others)
                {
                    return (StatusCode::FORBIDDEN, "Permission Denied.".to_string())
                        .into_response();
                }
                Some(Some(barcode.id))
            }
            Ok(None) => {
                return (StatusCode::BAD_REQUEST, "Unknown barcode".to_string()).into_response();
            }
            Err(err) => {
                error!("Failed to resolve barcode: {err}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                )
                    .into_response();
            }
        },
        None => None,
    };

    let result = async {
        repo::update_settings(
            &pool,
            authed.user.id,
            barcode_id,
            request.server_verification,
            request.associate_user_profile_with_barcode,
        )
        .await?;
        repo::update_pull_settings(
            &pool,
            authed.user.id,
            request.pull_setting,
            request.gender_setting,
        )
        .await
    }
    .await;

    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(MessageResponse::new("Settings updated")),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to update settings: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    patch,
    path = "/barcode_dashboard",
    request_body = DashboardPatchRequest,
    responses(
        (status = 200, description = "Barcode updated", body = MessageResponse),
        (status = 403, description = "School role required", body = String),
        (status = 404, description = "Barcode not found or not owned", body = String)
    ),
    tag = "barcode"
)]
pub async fn patch_barcode(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<DashboardPatchRequest>>,
) -> impl IntoResponse {
    let authed = match gate(&headers, &method, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    if request.daily_usage_limit.is_some_and(|limit| limit < 0)
        || request.total_usage_limit.is_some_and(|limit| limit < 0)
    {
        return (
            StatusCode::BAD_REQUEST,
            "Limits must be non-negative".to_string(),
        )
            .into_response();
    }

    let barcode = match repo::get_barcode_by_uuid(&pool, request.barcode_uuid).await {
        Ok(Some(barcode)) if barcode.owner_id == authed.user.id => barcode,
        Ok(_) => {
            return (StatusCode::NOT_FOUND, "Barcode not found".to_string()).into_response();
        }
        Err(err) => {
            error!("Failed to resolve barcode: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response();
        }
    };

    let result = async {
        if let Some(share) = request.share_with_others {
            repo::update_share_flag(&pool, authed.user.id, barcode.barcode_uuid, share).await?;
        }
        if request.daily_usage_limit.is_some() || request.total_usage_limit.is_some() {
            repo::update_usage_limits(
                &pool,
                barcode.id,
                request.daily_usage_limit,
                request.total_usage_limit,
            )
            .await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(MessageResponse::new("Barcode updated")),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to patch barcode: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    delete,
    path = "/barcode_dashboard",
    request_body = DashboardDeleteRequest,
    responses(
        (status = 200, description = "Barcode deleted", body = MessageResponse),
        (status = 400, description = "Identification barcodes cannot be deleted", body = String),
        (status = 404, description = "Barcode not found or not owned", body = String)
    ),
    tag = "barcode"
)]
pub async fn delete_barcode(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<DashboardDeleteRequest>>,
) -> impl IntoResponse {
    let authed = match gate(&headers, &method, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    match repo::get_barcode_by_uuid(&pool, request.barcode_uuid).await {
        Ok(Some(barcode)) if barcode.owner_id == authed.user.id => {
            if barcode.barcode_type == BarcodeType::Identification {
                return (
                    StatusCode::BAD_REQUEST,
                    "Identification barcodes cannot be deleted".to_string(),
                )
                    .into_response();
            }
        }
        Ok(_) => {
            return (StatusCode::NOT_FOUND, "Barcode not found".to_string()).into_response();
        }
        Err(err) => {
            error!("Failed to resolve barcode: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response();
        }
    }

    match repo::delete_owned_barcode(&pool, authed.user.id, request.barcode_uuid).await {
        Ok(true) => (
            StatusCode::OK,
            Json(MessageResponse::new("Barcode deleted")),
        )
            .into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "Barcode not found".to_string()).into_response(),
        Err(err) => {
            error!("Failed to delete barcode: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
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
    use crate::api::handlers::auth::rate_limit::NoopRateLimiter;
    use crate::api::handlers::auth::state::AuthConfig;
    use secrecy::SecretString;

    fn auth_state() -> Arc<AuthState> {
        Arc::new(
            AuthState::new(
                AuthConfig::new("https://id.campus.edu".to_string()),
                SecretString::from("secret"),
                Arc::new(NoopRateLimiter),
            )
            .expect("auth state"),
        )
    }

    fn lazy_pool() -> PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool")
    }

    #[test]
    fn minted_dynamic_values_are_numeric() {
        let value = random_numeric(DYNAMIC_VALUE_DIGITS);
        assert_eq!(value.len(), DYNAMIC_VALUE_DIGITS);
        assert!(value.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn dashboard_requires_authentication() {
        let response = dashboard(
            HeaderMap::new(),
            Method::GET,
            Extension(lazy_pool()),
            Extension(auth_state()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
