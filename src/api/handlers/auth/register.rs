//! Account registration with auto-login.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use regex::Regex;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::users::{self, SignupOutcome};

use super::challenge::throttled;
use super::password;
use super::rate_limit::{Decision, Scope};
use super::session::set_session_cookies;
use super::state::AuthState;
use super::types::{MessageResponse, RegisterRequest};
use super::utils::extract_client_ip;

const MIN_PASSWORD_LENGTH: usize = 8;

fn valid_username(username: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").is_ok_and(|regex| regex.is_match(username))
}

#[utoipa::path(
    post,
    path = "/authn/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created, session cookies set", body = MessageResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn register(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RegisterRequest>>,
) -> impl IntoResponse {
    let client_ip = extract_client_ip(&headers).unwrap_or_default();
    if let Decision::Limited { retry_after_secs } = auth_state
        .rate_limiter()
        .check(Scope::Registration, &client_ip)
    {
        return throttled(retry_after_secs);
    }

    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let username = request.username.trim().to_string();
    if !valid_username(&username) {
        return (StatusCode::BAD_REQUEST, "Invalid username".to_string()).into_response();
    }
    if request.password.len() < MIN_PASSWORD_LENGTH {
        return (StatusCode::BAD_REQUEST, "Password too short".to_string()).into_response();
    }
    let name = request.name.trim();
    let information_id = request.information_id.trim();
    if name.is_empty() || information_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Name and information id are required".to_string(),
        )
            .into_response();
    }

    let password_hash = match password::hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Password hashing failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response();
        }
    };

    let user = match users::create_with_profile(&pool, &username, &password_hash, name, information_id)
        .await
    {
        Ok(SignupOutcome::Created(user)) => user,
        Ok(SignupOutcome::Conflict) => {
            return (
                StatusCode::BAD_REQUEST,
                "Username already taken".to_string(),
            )
                .into_response();
        }
        Err(err) => {
            error!("Registration failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response();
        }
    };

    // Auto-login: fresh accounts get session cookies immediately.
    let pair = match auth_state.tokens().issue_pair(&pool, user.id).await {
        Ok(pair) => pair,
        Err(err) => {
            error!("Token issuance failed after registration: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    set_session_cookies(&mut response_headers, &auth_state, &pair.access, &pair.refresh);
    (
        StatusCode::CREATED,
        response_headers,
        Json(MessageResponse::new("Registration successful")),
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

    #[test]
    fn username_rules() {
        assert!(valid_username("alice"));
        assert!(valid_username("alice.smith_01"));
        assert!(!valid_username("al"));
        assert!(!valid_username("alice and bob"));
        assert!(!valid_username(&"a".repeat(33)));
    }

    #[tokio::test]
    async fn register_missing_payload_is_rejected() {
        let response = register(
            HeaderMap::new(),
            Extension(lazy_pool()),
            Extension(auth_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_rejects_short_password() {
        let response = register(
            HeaderMap::new(),
            Extension(lazy_pool()),
            Extension(auth_state()),
            Some(Json(RegisterRequest {
                username: "alice".to_string(),
                password: "short".to_string(),
                name: "Alice".to_string(),
                information_id: "A100".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
