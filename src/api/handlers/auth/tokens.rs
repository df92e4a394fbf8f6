//! Token refresh and logout endpoints.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::token::TokenError;

use super::challenge::throttled;
use super::rate_limit::{Decision, Scope};
use super::session::{
    REFRESH_COOKIE_NAME, clear_access_cookie, clear_refresh_cookie, set_session_cookies,
};
use super::state::AuthState;
use super::types::{MessageResponse, RefreshRequest};
use super::utils::{cookie_value, extract_client_ip};

#[utoipa::path(
    post,
    path = "/authn/token/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Pair rotated, cookies replaced", body = MessageResponse),
        (status = 401, description = "Refresh token invalid or revoked", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RefreshRequest>>,
) -> impl IntoResponse {
    let client_ip = extract_client_ip(&headers).unwrap_or_default();
    if let Decision::Limited { retry_after_secs } =
        auth_state.rate_limiter().check(Scope::Anon, &client_ip)
    {
        return throttled(retry_after_secs);
    }

    let presented = payload
        .and_then(|Json(request)| request.refresh)
        .or_else(|| cookie_value(&headers, REFRESH_COOKIE_NAME));
    let Some(presented) = presented else {
        return (StatusCode::UNAUTHORIZED, "Missing refresh token".to_string()).into_response();
    };

    match auth_state.tokens().refresh(&pool, &presented).await {
        Ok(pair) => {
            let mut response_headers = HeaderMap::new();
            set_session_cookies(&mut response_headers, &auth_state, &pair.access, &pair.refresh);
            (
                StatusCode::OK,
                response_headers,
                Json(MessageResponse::new("Token refreshed")),
            )
                .into_response()
        }
        Err(TokenError::Invalid | TokenError::Revoked) => {
            (StatusCode::UNAUTHORIZED, "Invalid refresh token".to_string()).into_response()
        }
        Err(TokenError::Internal(err)) => {
            error!("Token rotation failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/authn/logout",
    responses(
        (status = 200, description = "Cookies cleared", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    // Best effort: a presented refresh token is blacklisted, but logout
    // always clears the cookies and reports success.
    if let Some(refresh_token) = cookie_value(&headers, REFRESH_COOKIE_NAME) {
        auth_state
            .tokens()
            .blacklist_presented_refresh(&pool, &refresh_token)
            .await;
    }

    let mut response_headers = HeaderMap::new();
    match clear_access_cookie(&auth_state) {
        Ok(cookie) => {
            response_headers.append(axum::http::header::SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to clear access cookie: {err}"),
    }
    match clear_refresh_cookie(&auth_state) {
        Ok(cookie) => {
            response_headers.append(axum::http::header::SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to clear refresh cookie: {err}"),
    }

    (
        StatusCode::OK,
        response_headers,
        Json(MessageResponse::new("Logged out")),
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
    async fn refresh_without_token_is_unauthorized() {
        let response = refresh(
            HeaderMap::new(),
            Extension(lazy_pool()),
            Extension(auth_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_with_garbage_token_is_unauthorized() {
        let response = refresh(
            HeaderMap::new(),
            Extension(lazy_pool()),
            Extension(auth_state()),
            Some(Json(RefreshRequest {
                refresh: Some("not.a.jwt".to_string()),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_always_clears_cookies() {
        let response = logout(HeaderMap::new(), Extension(lazy_pool()), Extension(auth_state()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let cookies: Vec<_> = response
            .headers()
            .get_all(axum::http::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|cookie| cookie.contains("Max-Age=0")));
    }
}
