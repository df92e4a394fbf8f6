//! Cookie/bearer session identity and CSRF enforcement.
//!
//! One authentication primitive serves both transport styles: a bearer
//! Authorization header or the `access_token` cookie. Cookie-authenticated
//! unsafe methods must additionally present a CSRF header matching the CSRF
//! cookie (double submit); bearer requests bypass CSRF because the header
//! cannot be attached cross-site.

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header::InvalidHeaderValue};
use sqlx::PgPool;
use tracing::error;

use crate::token::Claims;
use crate::users::{self, UserRecord};

use super::challenge::CSRF_COOKIE_NAME;
use super::state::AuthState;
use super::utils::{cookie_value, extract_bearer_token};

pub(crate) const ACCESS_COOKIE_NAME: &str = "access_token";
pub(crate) const REFRESH_COOKIE_NAME: &str = "refresh_token";
const CSRF_HEADER_NAME: &str = "x-csrf-token";
const REFRESH_COOKIE_PATH: &str = "/authn/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTransport {
    Cookie,
    Bearer,
}

/// An authenticated caller with the claims that admitted it.
pub struct Authenticated {
    pub user: UserRecord,
    pub claims: Claims,
    pub transport: AuthTransport,
}

/// Resolves the request's identity from bearer header or access cookie.
///
/// # Errors
/// `(401, ...)` for missing/invalid/revoked credentials, `(500, ...)` when
/// the account lookup fails.
pub async fn authenticate(
    headers: &HeaderMap,
    pool: &PgPool,
    auth_state: &AuthState,
) -> Result<Authenticated, (StatusCode, String)> {
    let unauthorized = || (StatusCode::UNAUTHORIZED, "Unauthorized".to_string());

    let (token, transport) = if let Some(token) = extract_bearer_token(headers) {
        (token, AuthTransport::Bearer)
    } else if let Some(token) = cookie_value(headers, ACCESS_COOKIE_NAME) {
        (token, AuthTransport::Cookie)
    } else {
        return Err(unauthorized());
    };

    let claims = auth_state
        .tokens()
        .validate_access(pool, &token)
        .await
        .map_err(|_| unauthorized())?;

    let user = users::get_by_id(pool, claims.sub).await.map_err(|err| {
        error!("Failed to load authenticated user: {err}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error".to_string(),
        )
    })?;
    let user = user.filter(|user| user.is_active).ok_or_else(unauthorized)?;

    Ok(Authenticated {
        user,
        claims,
        transport,
    })
}

/// Enforce CSRF on unsafe methods for cookie-authenticated requests.
///
/// # Errors
/// `(403, ...)` when the header is missing or does not match the cookie.
pub fn enforce_csrf(
    headers: &HeaderMap,
    method: &Method,
    transport: AuthTransport,
) -> Result<(), (StatusCode, String)> {
    if transport == AuthTransport::Bearer {
        return Ok(());
    }
    if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(());
    }

    let cookie = cookie_value(headers, CSRF_COOKIE_NAME);
    let header = headers
        .get(CSRF_HEADER_NAME)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);

    match (cookie, header) {
        (Some(cookie), Some(header)) if cookie == header => Ok(()),
        _ => Err((
            StatusCode::FORBIDDEN,
            "CSRF verification failed".to_string(),
        )),
    }
}

/// HttpOnly access cookie valid for the whole surface.
pub(crate) fn access_cookie(
    auth_state: &AuthState,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let max_age = auth_state.config().access_token_lifetime_minutes() * 60;
    build_cookie(auth_state, ACCESS_COOKIE_NAME, token, "/", max_age)
}

/// HttpOnly refresh cookie scoped to the auth prefix.
pub(crate) fn refresh_cookie(
    auth_state: &AuthState,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let max_age = auth_state.config().refresh_token_lifetime_days() * 24 * 60 * 60;
    build_cookie(
        auth_state,
        REFRESH_COOKIE_NAME,
        token,
        REFRESH_COOKIE_PATH,
        max_age,
    )
}

pub(crate) fn clear_access_cookie(
    auth_state: &AuthState,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build_cookie(auth_state, ACCESS_COOKIE_NAME, "", "/", 0)
}

pub(crate) fn clear_refresh_cookie(
    auth_state: &AuthState,
) -> Result<HeaderValue, InvalidHeaderValue> {
    build_cookie(auth_state, REFRESH_COOKIE_NAME, "", REFRESH_COOKIE_PATH, 0)
}

fn build_cookie(
    auth_state: &AuthState,
    name: &str,
    value: &str,
    path: &str,
    max_age: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie =
        format!("{name}={value}; Path={path}; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if auth_state.config().cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Sets both session cookies on a response header map.
pub(crate) fn set_session_cookies(
    headers: &mut HeaderMap,
    auth_state: &AuthState,
    access: &str,
    refresh: &str,
) {
    match access_cookie(auth_state, access) {
        Ok(cookie) => {
            headers.append(axum::http::header::SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build access cookie: {err}"),
    }
    match refresh_cookie(auth_state, refresh) {
        Ok(cookie) => {
            headers.append(axum::http::header::SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build refresh cookie: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::rate_limit::NoopRateLimiter;
    use crate::api::handlers::auth::state::AuthConfig;
    use secrecy::SecretString;
    use std::sync::Arc;

    fn auth_state() -> AuthState {
        AuthState::new(
            AuthConfig::new("https://id.campus.edu".to_string()),
            SecretString::from("secret"),
            Arc::new(NoopRateLimiter),
        )
        .expect("auth state")
    }

    fn csrf_headers(cookie: &str, header: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str(&format!("csrf_token={cookie}")).expect("cookie"),
        );
        if let Some(header_value) = header {
            headers.insert(
                CSRF_HEADER_NAME,
                HeaderValue::from_str(header_value).expect("header"),
            );
        }
        headers
    }

    #[test]
    fn bearer_requests_bypass_csrf() {
        let headers = HeaderMap::new();
        assert!(enforce_csrf(&headers, &Method::POST, AuthTransport::Bearer).is_ok());
    }

    #[test]
    fn safe_methods_bypass_csrf() {
        let headers = HeaderMap::new();
        assert!(enforce_csrf(&headers, &Method::GET, AuthTransport::Cookie).is_ok());
    }

    #[test]
    fn cookie_mutation_requires_matching_token() {
        let headers = csrf_headers("tok", Some("tok"));
        assert!(enforce_csrf(&headers, &Method::POST, AuthTransport::Cookie).is_ok());

        let headers = csrf_headers("tok", Some("other"));
        assert!(enforce_csrf(&headers, &Method::POST, AuthTransport::Cookie).is_err());

        let headers = csrf_headers("tok", None);
        assert!(enforce_csrf(&headers, &Method::DELETE, AuthTransport::Cookie).is_err());
    }

    #[test]
    fn access_cookie_attributes() {
        let state = auth_state();
        let cookie = access_cookie(&state, "tok").expect("cookie");
        let value = cookie.to_str().expect("ascii");
        assert!(value.starts_with("access_token=tok; Path=/;"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.contains("Secure"));
        assert!(value.contains("Max-Age=1800"));
    }

    #[test]
    fn refresh_cookie_is_path_scoped() {
        let state = auth_state();
        let cookie = refresh_cookie(&state, "tok").expect("cookie");
        let value = cookie.to_str().expect("ascii");
        assert!(value.contains("Path=/authn/"));
        assert!(value.contains("Max-Age=604800"));
    }

    #[test]
    fn clearing_cookies_zeroes_max_age() {
        let state = auth_state();
        let cookie = clear_access_cookie(&state).expect("cookie");
        assert!(cookie.to_str().expect("ascii").contains("Max-Age=0"));
        let cookie = clear_refresh_cookie(&state).expect("cookie");
        assert!(cookie.to_str().expect("ascii").contains("Max-Age=0"));
    }
}
