//! Password login over the RSA challenge flow.
//!
//! The request carries the username and an RSA-OAEP ciphertext of
//! `{nonce, password}`. Every client-visible failure collapses to one
//! generic message so the surface cannot be used to enumerate accounts;
//! the audit log keeps the precise reason.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::users;

use super::audit::{self, AuditResult};
use super::challenge::{self, ConsumeOutcome, throttled};
use super::lockout;
use super::password;
use super::rate_limit::{Decision, Scope};
use super::session::set_session_cookies;
use super::state::AuthState;
use super::types::{EncryptedCredentials, LoginRequest, MessageResponse};
use super::utils::{decode_base64_field, extract_client_ip, user_agent};

pub(super) const GENERIC_LOGIN_ERROR: &str = "Invalid username or password.";

#[utoipa::path(
    post,
    path = "/authn/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful, session cookies set", body = MessageResponse),
        (status = 400, description = "Invalid credentials", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let client_ip = extract_client_ip(&headers);
    let agent = user_agent(&headers);
    let username = request.username.trim().to_string();

    if let Decision::Limited { retry_after_secs } = auth_state
        .rate_limiter()
        .check(Scope::Login, client_ip.as_deref().unwrap_or_default())
    {
        return throttled(retry_after_secs);
    }
    // Keyed on the submitted username so one exhausted account does not
    // lock the surface for everyone behind the same address.
    if let Decision::Limited { retry_after_secs } = auth_state
        .rate_limiter()
        .check(Scope::LoginUsername, &username)
    {
        return throttled(retry_after_secs);
    }

    let fail = |reason: &'static str| {
        let pool = pool.0.clone();
        let username = username.clone();
        let client_ip = client_ip.clone();
        let agent = agent.clone();
        async move {
            audit::record(
                &pool,
                &username,
                client_ip.as_deref(),
                &agent,
                AuditResult::Failure,
                Some(reason),
                None,
            )
            .await;
            (StatusCode::BAD_REQUEST, GENERIC_LOGIN_ERROR.to_string()).into_response()
        }
    };

    // Decrypt before touching any account state.
    let ciphertext = match decode_base64_field(&request.password) {
        Ok(bytes) => bytes,
        Err(_) => return fail("malformed_ciphertext").await,
    };
    let plaintext = match auth_state.keys().decrypt(&pool, &ciphertext).await {
        Ok(plaintext) => plaintext,
        Err(_) => return fail("decrypt_failed").await,
    };
    let Ok(credentials) = serde_json::from_slice::<EncryptedCredentials>(&plaintext) else {
        return fail("malformed_payload").await;
    };

    // Single-use nonce: replayed ciphertexts die here.
    let nonce = match decode_base64_field(&credentials.nonce) {
        Ok(nonce) => nonce,
        Err(_) => return fail("invalid_nonce").await,
    };
    match challenge::consume(&pool, &nonce).await {
        Ok(ConsumeOutcome::Consumed) => {}
        Ok(ConsumeOutcome::Expired) => return fail("challenge_expired").await,
        Ok(ConsumeOutcome::Unknown) => return fail("invalid_nonce").await,
        Err(err) => {
            error!("Challenge consumption failed: {err}");
            return internal_error();
        }
    }

    let user = match users::get_by_username(&pool, &username).await {
        Ok(user) => user,
        Err(err) => {
            error!("User lookup failed: {err}");
            return internal_error();
        }
    };
    let Some(user) = user else {
        record_failure_counters(&pool, &auth_state, &username, client_ip.as_deref()).await;
        return fail("unknown_username").await;
    };

    if !password::verify_password(&credentials.password, &user.password_hash) {
        record_failure_counters(&pool, &auth_state, &username, client_ip.as_deref()).await;
        return fail("invalid_credentials").await;
    }

    match lockout::is_blocked(&pool, &username).await {
        Ok(true) => {
            audit::record(
                &pool,
                &username,
                client_ip.as_deref(),
                &agent,
                AuditResult::Blocked,
                Some("account_locked"),
                Some(user.id),
            )
            .await;
            return (StatusCode::BAD_REQUEST, GENERIC_LOGIN_ERROR.to_string()).into_response();
        }
        Ok(false) => {}
        Err(err) => {
            error!("Lockout check failed: {err}");
            return internal_error();
        }
    }

    if !user.is_active {
        return fail("account_inactive").await;
    }

    if password::needs_rehash(&user.password_hash) {
        password::rehash_if_needed(&pool, user.id, &credentials.password).await;
    }

    if let Err(err) = lockout::reset(&pool, &username, client_ip.as_deref()).await {
        error!("Failed to reset lockout counters: {err}");
    }
    audit::record(
        &pool,
        &username,
        client_ip.as_deref(),
        &agent,
        AuditResult::Success,
        None,
        Some(user.id),
    )
    .await;

    let pair = match auth_state.tokens().issue_pair(&pool, user.id).await {
        Ok(pair) => pair,
        Err(err) => {
            error!("Token issuance failed: {err}");
            return internal_error();
        }
    };

    let mut response_headers = HeaderMap::new();
    set_session_cookies(&mut response_headers, &auth_state, &pair.access, &pair.refresh);
    (
        StatusCode::OK,
        response_headers,
        Json(MessageResponse::new("Login successful")),
    )
        .into_response()
}



async fn record_failure_counters(
    pool: &PgPool,
    auth_state: &AuthState,
    username: &str,
    ip: Option<&str>,
) {
    if let Err(err) = lockout::record_failure(
        pool,
        username,
        ip,
        auth_state.config().max_failed_login_attempts(),
        auth_state.config().account_lockout_minutes(),
    )
    .await
    {
        error!("Failed to record login failure: {err}");
    }
}

fn internal_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal error".to_string(),
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
    async fn login_missing_payload_is_rejected() {
        let response = login(
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
    async fn login_rejects_unpadded_garbage_ciphertext() {
        // Invalid base64 fails before any database work, so even a lazy
        // pool with no server behind it answers with the generic error.
        let response = login(
            HeaderMap::new(),
            Extension(lazy_pool()),
            Extension(auth_state()),
            Some(Json(LoginRequest {
                username: "alice".to_string(),
                password: "!!! not base64 !!!".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
