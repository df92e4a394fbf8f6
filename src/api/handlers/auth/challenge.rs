//! Login challenge issuance and single-use consumption.
//!
//! A challenge is a random nonce bound to the advertised RSA key. Clients
//! encrypt `{nonce, password}` under that key; consumption is one atomic
//! `DELETE ... RETURNING`, so two concurrent logins with the same nonce see
//! at most one success.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
    response::IntoResponse,
};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{Instrument, error};
use uuid::Uuid;

use super::rate_limit::{Decision, Scope};
use super::state::AuthState;
use super::types::ChallengeResponse;
use super::utils::{extract_client_ip, generate_csrf_token};

pub(crate) const CSRF_COOKIE_NAME: &str = "csrf_token";
const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed,
    Expired,
    Unknown,
}

/// Atomically consume a nonce. Expired rows are removed and reported as
/// such; unknown nonces were either never issued or already used.
///
/// # Errors
/// Returns error if the database query fails.
pub async fn consume(pool: &PgPool, nonce: &[u8]) -> Result<ConsumeOutcome> {
    let query = "DELETE FROM login_challenges WHERE nonce = $1 RETURNING expires_at";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(nonce)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume login challenge")?;

    Ok(match row {
        Some(row) => {
            let expires_at: DateTime<Utc> = row.get("expires_at");
            if expires_at > Utc::now() {
                ConsumeOutcome::Consumed
            } else {
                ConsumeOutcome::Expired
            }
        }
        None => ConsumeOutcome::Unknown,
    })
}

async fn issue(pool: &PgPool, kid: Uuid, ttl_seconds: i64, nonce_len: usize) -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; nonce_len];
    OsRng
        .try_fill_bytes(&mut nonce)
        .context("failed to generate challenge nonce")?;

    let query = r"
        INSERT INTO login_challenges (nonce, kid, expires_at)
        VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&nonce)
        .bind(kid)
        .bind(ttl_seconds)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to store login challenge")?;

    Ok(nonce)
}

#[utoipa::path(
    get,
    path = "/authn/login/challenge",
    responses(
        (status = 200, description = "Login challenge issued", body = ChallengeResponse),
        (status = 429, description = "Rate limited", body = String),
        (status = 503, description = "No active keypair", body = String)
    ),
    tag = "auth"
)]
pub async fn login_challenge(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let client_ip = extract_client_ip(&headers).unwrap_or_default();
    if let Decision::Limited { retry_after_secs } =
        auth_state.rate_limiter().check(Scope::Anon, &client_ip)
    {
        return throttled(retry_after_secs);
    }

    let active = match auth_state.keys().active(&pool).await {
        Ok(active) => active,
        Err(err) => {
            error!("No keypair available for login challenge: {err}");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
            )
                .into_response();
        }
    };

    let ttl_s = auth_state.config().login_challenge_ttl_seconds();
    let nonce = match issue(
        &pool,
        active.kid,
        ttl_s,
        auth_state.config().login_challenge_nonce_bytes(),
    )
    .await
    {
        Ok(nonce) => nonce,
        Err(err) => {
            error!("Failed to issue login challenge: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Challenge issuance failed".to_string(),
            )
                .into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(CONTENT_SECURITY_POLICY) {
        response_headers.insert("content-security-policy", value);
    }
    match generate_csrf_token().map(|token| csrf_cookie(&auth_state, &token)) {
        Ok(Ok(cookie)) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Ok(Err(err)) => error!("Failed to build CSRF cookie: {err}"),
        Err(err) => error!("Failed to generate CSRF token: {err}"),
    }

    let body = ChallengeResponse {
        nonce: STANDARD.encode(nonce),
        kid: active.kid.to_string(),
        public_key: active.public_pem,
        ttl_s,
    };
    (StatusCode::OK, response_headers, Json(body)).into_response()
}

/// The CSRF cookie is deliberately readable by scripts: clients echo it in
/// the `X-CSRF-Token` header on cookie-authenticated mutations.
fn csrf_cookie(
    auth_state: &AuthState,
    token: &str,
) -> Result<HeaderValue, axum::http::header::InvalidHeaderValue> {
    let mut cookie = format!("{CSRF_COOKIE_NAME}={token}; Path=/; SameSite=Lax");
    if auth_state.config().cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn throttled(retry_after_secs: u64) -> axum::response::Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        headers.insert(axum::http::header::RETRY_AFTER, value);
    }
    (
        StatusCode::TOO_MANY_REQUESTS,
        headers,
        "Rate limited".to_string(),
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

    #[test]
    fn csrf_cookie_is_script_readable() {
        let state = auth_state();
        let cookie = csrf_cookie(&state, "token").expect("cookie");
        let value = cookie.to_str().expect("ascii");
        assert!(value.starts_with("csrf_token=token"));
        assert!(!value.contains("HttpOnly"));
        assert!(value.contains("Secure"));
        assert!(value.contains("SameSite=Lax"));
    }

    #[test]
    fn throttled_response_carries_retry_after() {
        let response = throttled(42);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(axum::http::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("42")
        );
    }

    #[tokio::test]
    async fn login_challenge_without_keys_is_unavailable() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let response = login_challenge(HeaderMap::new(), Extension(pool), Extension(auth_state()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
