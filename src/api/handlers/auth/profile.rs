//! Account info and profile endpoints.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::users::{self, UserProfile};

use super::challenge::throttled;
use super::rate_limit::{Decision, Scope};
use super::session::{authenticate, enforce_csrf};
use super::state::AuthState;
use super::types::{MessageResponse, ProfileResponse, ProfileUpdateRequest, UserInfoResponse};

fn profile_response(profile: UserProfile, include_avatar: bool) -> ProfileResponse {
    let avatar = if include_avatar {
        profile.avatar.map(|bytes| STANDARD.encode(bytes))
    } else {
        None
    };
    ProfileResponse {
        name: profile.name,
        information_id: profile.information_id,
        profile_uuid: profile.profile_uuid,
        user_profile_img_base64: avatar,
    }
}

#[utoipa::path(
    get,
    path = "/authn/user_info",
    responses(
        (status = 200, description = "Caller identity and groups", body = UserInfoResponse),
        (status = 401, description = "Unauthorized", body = String)
    ),
    tag = "auth"
)]
pub async fn user_info(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let authed = match authenticate(&headers, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };

    let profile = match users::get_profile(&pool, authed.user.id).await {
        Ok(profile) => profile.map(|profile| profile_response(profile, false)),
        Err(err) => {
            error!("Failed to load profile: {err}");
            None
        }
    };

    (
        StatusCode::OK,
        Json(UserInfoResponse {
            username: authed.user.username,
            groups: authed.user.groups,
            profile,
        }),
    )
        .into_response()
}

#[utoipa::path(
    get,
    path = "/authn/profile",
    responses(
        (status = 200, description = "Caller profile", body = ProfileResponse),
        (status = 401, description = "Unauthorized", body = String),
        (status = 404, description = "No profile", body = String)
    ),
    tag = "auth"
)]
pub async fn get_profile(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let authed = match authenticate(&headers, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };

    match users::get_profile(&pool, authed.user.id).await {
        Ok(Some(profile)) => {
            (StatusCode::OK, Json(profile_response(profile, true))).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, "No profile".to_string()).into_response(),
        Err(err) => {
            error!("Failed to load profile: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    put,
    path = "/authn/profile",
    request_body = ProfileUpdateRequest,
    responses(
        (status = 200, description = "Profile updated", body = MessageResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Unauthorized", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn update_profile(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ProfileUpdateRequest>>,
) -> impl IntoResponse {
    let authed = match authenticate(&headers, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };
    if let Err((status, message)) = enforce_csrf(&headers, &method, authed.transport) {
        return (status, message).into_response();
    }
    if let Decision::Limited { retry_after_secs } = auth_state
        .rate_limiter()
        .check(Scope::UserProfile, &authed.user.id.to_string())
    {
        return throttled(retry_after_secs);
    }

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let avatar = match request.user_profile_img_base64.as_deref() {
        Some(encoded) => match STANDARD.decode(encoded.trim()) {
            Ok(bytes) => Some(bytes),
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "Invalid avatar encoding".to_string())
                    .into_response();
            }
        },
        None => None,
    };

    let name = request.name.as_deref().map(str::trim);
    if name.is_some_and(str::is_empty) {
        return (StatusCode::BAD_REQUEST, "Name must not be empty".to_string()).into_response();
    }
    let information_id = request.information_id.as_deref().map(str::trim);
    if information_id.is_some_and(str::is_empty) {
        return (
            StatusCode::BAD_REQUEST,
            "Information id must not be empty".to_string(),
        )
            .into_response();
    }

    if let Err(err) = users::update_profile(
        &pool,
        authed.user.id,
        name,
        information_id,
        avatar.as_deref(),
    )
    .await
    {
        error!("Failed to update profile: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error".to_string(),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(MessageResponse::new("Profile updated")),
    )
        .into_response()
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

    #[tokio::test]
    async fn user_info_requires_authentication() {
        let response = user_info(
            HeaderMap::new(),
            Extension(lazy_pool()),
            Extension(auth_state()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn update_profile_requires_authentication() {
        let response = update_profile(
            HeaderMap::new(),
            Method::PUT,
            Extension(lazy_pool()),
            Extension(auth_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
