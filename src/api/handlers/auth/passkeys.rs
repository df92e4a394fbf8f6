//! Passkey registration and authentication endpoints.
//!
//! Registration is an authenticated operation and replaces any prior
//! credential (one passkey per account). Authentication mints the same
//! session cookies as password login. Failures surface as a generic
//! "Authentication failed"; details go to the log.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;
use webauthn_rs::prelude::DiscoverableKey;

use crate::users;
use crate::webauthn::repo::PasskeyRepo;
use crate::webauthn::service::{
    AuthCeremony, PasskeyCeremonyError, deserialize_passkey, serialize_passkey,
};

use super::audit::{self, AuditResult};
use super::challenge::throttled;
use super::rate_limit::{Decision, Scope};
use super::session::{authenticate, enforce_csrf, set_session_cookies};
use super::state::AuthState;
use super::types::{
    MessageResponse, PasskeyAuthOptionsRequest, PasskeyAuthOptionsResponse,
    PasskeyAuthVerifyRequest, PasskeyRegisterOptionsResponse, PasskeyRegisterVerifyRequest,
};
use super::utils::{extract_client_ip, user_agent};

const GENERIC_PASSKEY_ERROR: &str = "Authentication failed";

#[utoipa::path(
    post,
    path = "/authn/passkey/register/options",
    responses(
        (status = 200, description = "Registration challenge issued", body = PasskeyRegisterOptionsResponse),
        (status = 401, description = "Unauthorized", body = String)
    ),
    tag = "passkeys"
)]
pub async fn register_options(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let authed = match authenticate(&headers, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };

    // Exclude the current credential so the authenticator offers a
    // replacement instead of failing on a duplicate.
    let exclude = match PasskeyRepo::get_for_user(&pool, authed.user.id).await {
        Ok(stored) => stored.and_then(|credential| {
            deserialize_passkey(&credential.passkey_data)
                .map(|passkey| passkey.cred_id().clone())
                .ok()
        }),
        Err(err) => {
            error!("Failed to load stored passkey: {err}");
            None
        }
    };

    match auth_state
        .passkeys()
        .register_begin(authed.user.id, &authed.user.username, exclude)
        .await
    {
        Ok((reg_id, options)) => (
            StatusCode::OK,
            Json(PasskeyRegisterOptionsResponse {
                registration_id: reg_id.to_string(),
                options,
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to begin passkey registration: {err}");
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
    path = "/authn/passkey/register/verify",
    request_body = PasskeyRegisterVerifyRequest,
    responses(
        (status = 200, description = "Passkey registered", body = MessageResponse),
        (status = 400, description = "Verification failed", body = String),
        (status = 401, description = "Unauthorized", body = String)
    ),
    tag = "passkeys"
)]
pub async fn register_verify(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<PasskeyRegisterVerifyRequest>>,
) -> impl IntoResponse {
    let authed = match authenticate(&headers, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };
    if let Err((status, message)) = enforce_csrf(&headers, &method, authed.transport) {
        return (status, message).into_response();
    }
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let Ok(reg_id) = Uuid::parse_str(request.registration_id.trim()) else {
        return (StatusCode::BAD_REQUEST, "Invalid registration id".to_string()).into_response();
    };

    let passkey = match auth_state
        .passkeys()
        .register_finish(reg_id, authed.user.id, &request.credential)
        .await
    {
        Ok(passkey) => passkey,
        Err(err) => {
            log_ceremony_error("registration", &err);
            return (
                StatusCode::BAD_REQUEST,
                GENERIC_PASSKEY_ERROR.to_string(),
            )
                .into_response();
        }
    };

    let credential_id = URL_SAFE_NO_PAD.encode(passkey.cred_id());
    let serialized = match serialize_passkey(&passkey) {
        Ok(serialized) => serialized,
        Err(err) => {
            error!("Failed to serialize passkey: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response();
        }
    };
    if let Err(err) =
        PasskeyRepo::replace_for_user(&pool, authed.user.id, &credential_id, &serialized, 0, "none")
            .await
    {
        error!("Failed to store passkey: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error".to_string(),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(MessageResponse::new("Passkey registered")),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/authn/passkey/auth/options",
    request_body = PasskeyAuthOptionsRequest,
    responses(
        (status = 200, description = "Authentication challenge issued", body = PasskeyAuthOptionsResponse),
        (status = 400, description = "No usable credential", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "passkeys"
)]
pub async fn auth_options(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<PasskeyAuthOptionsRequest>>,
) -> impl IntoResponse {
    let client_ip = extract_client_ip(&headers).unwrap_or_default();
    if let Decision::Limited { retry_after_secs } =
        auth_state.rate_limiter().check(Scope::Login, &client_ip)
    {
        return throttled(retry_after_secs);
    }

    let username = payload
        .and_then(|Json(request)| request.username)
        .map(|username| username.trim().to_string())
        .filter(|username| !username.is_empty());

    let ceremony = match username {
        // A username hint restricts the allowed credentials to that
        // account's single passkey.
        Some(username) => begin_targeted(&pool, &auth_state, &username).await,
        None => auth_state
            .passkeys()
            .auth_begin_discoverable()
            .await
            .map(Some),
    };

    match ceremony {
        Ok(Some((auth_id, options))) => (
            StatusCode::OK,
            Json(PasskeyAuthOptionsResponse {
                authentication_id: auth_id.to_string(),
                options,
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::BAD_REQUEST,
            GENERIC_PASSKEY_ERROR.to_string(),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to begin passkey authentication: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

async fn begin_targeted(
    pool: &PgPool,
    auth_state: &AuthState,
    username: &str,
) -> anyhow::Result<Option<(Uuid, webauthn_rs::prelude::RequestChallengeResponse)>> {
    let Some(user) = users::get_by_username(pool, username).await? else {
        return Ok(None);
    };
    if !user.is_active {
        return Ok(None);
    }
    let Some(stored) = PasskeyRepo::get_for_user(pool, user.id).await? else {
        return Ok(None);
    };
    let passkey = deserialize_passkey(&stored.passkey_data)?;
    auth_state
        .passkeys()
        .auth_begin_targeted(user.id, &passkey)
        .await
        .map(Some)
}

#[utoipa::path(
    post,
    path = "/authn/passkey/auth/verify",
    request_body = PasskeyAuthVerifyRequest,
    responses(
        (status = 200, description = "Login successful, session cookies set", body = MessageResponse),
        (status = 401, description = "Authentication failed", body = String)
    ),
    tag = "passkeys"
)]
pub async fn auth_verify(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<PasskeyAuthVerifyRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let Ok(auth_id) = Uuid::parse_str(request.authentication_id.trim()) else {
        return unauthorized();
    };

    let ceremony = match auth_state.passkeys().take_auth(auth_id).await {
        Ok(ceremony) => ceremony,
        Err(err) => {
            log_ceremony_error("authentication", &err);
            return unauthorized();
        }
    };

    let (user_id, result) = match ceremony {
        AuthCeremony::Targeted {
            user_id,
            authentication,
        } => {
            match auth_state
                .passkeys()
                .finish_targeted(&request.credential, &authentication)
            {
                Ok(result) => (user_id, result),
                Err(err) => {
                    error!("Passkey authentication failed: {err}");
                    return unauthorized();
                }
            }
        }
        AuthCeremony::Discoverable { authentication } => {
            let user_id = match auth_state.passkeys().identify_discoverable(&request.credential) {
                Ok(user_id) => user_id,
                Err(err) => {
                    error!("Passkey identification failed: {err}");
                    return unauthorized();
                }
            };
            let passkey = match PasskeyRepo::get_for_user(&pool, user_id).await {
                Ok(Some(stored)) => match deserialize_passkey(&stored.passkey_data) {
                    Ok(passkey) => passkey,
                    Err(err) => {
                        error!("Stored passkey is unreadable: {err}");
                        return unauthorized();
                    }
                },
                Ok(None) => return unauthorized(),
                Err(err) => {
                    error!("Failed to load passkey: {err}");
                    return unauthorized();
                }
            };
            let keys = [DiscoverableKey::from(&passkey)];
            match auth_state
                .passkeys()
                .finish_discoverable(&request.credential, authentication, &keys)
            {
                Ok(result) => (user_id, result),
                Err(err) => {
                    error!("Passkey authentication failed: {err}");
                    return unauthorized();
                }
            }
        }
    };

    let user = match users::get_by_id(&pool, user_id).await {
        Ok(Some(user)) if user.is_active => user,
        Ok(_) => return unauthorized(),
        Err(err) => {
            error!("Failed to load user for passkey login: {err}");
            return unauthorized();
        }
    };

    // Advance the sign counter and persist the updated credential.
    if let Ok(Some(stored)) = PasskeyRepo::get_for_user(&pool, user.id).await {
        if let Ok(mut passkey) = deserialize_passkey(&stored.passkey_data) {
            passkey.update_credential(&result);
            match serialize_passkey(&passkey) {
                Ok(serialized) => {
                    if let Err(err) = PasskeyRepo::record_authentication(
                        &pool,
                        user.id,
                        &serialized,
                        i64::from(result.counter()),
                    )
                    .await
                    {
                        error!("Failed to advance sign counter: {err}");
                    }
                }
                Err(err) => error!("Failed to serialize updated passkey: {err}"),
            }
        }
    }

    let client_ip = extract_client_ip(&headers);
    audit::record(
        &pool,
        &user.username,
        client_ip.as_deref(),
        &user_agent(&headers),
        AuditResult::Success,
        Some("passkey"),
        Some(user.id),
    )
    .await;

    let pair = match auth_state.tokens().issue_pair(&pool, user.id).await {
        Ok(pair) => pair,
        Err(err) => {
            error!("Token issuance failed after passkey login: {err}");
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
        StatusCode::OK,
        response_headers,
        Json(MessageResponse::new("Login successful")),
    )
        .into_response()
}

fn unauthorized() -> axum::response::Response {
    (StatusCode::UNAUTHORIZED, GENERIC_PASSKEY_ERROR.to_string()).into_response()
}

fn log_ceremony_error(stage: &str, err: &PasskeyCeremonyError) {
    match err {
        PasskeyCeremonyError::NotFound => error!("Passkey {stage} state not found"),
        PasskeyCeremonyError::Expired => error!("Passkey {stage} state expired"),
        PasskeyCeremonyError::UserMismatch => error!("Passkey {stage} user mismatch"),
        PasskeyCeremonyError::Webauthn(inner) => error!("Passkey {stage} failed: {inner}"),
    }
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
    async fn register_options_requires_authentication() {
        let response = register_options(
            HeaderMap::new(),
            Extension(lazy_pool()),
            Extension(auth_state()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_verify_missing_payload_is_rejected() {
        let response = auth_verify(
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
    async fn auth_verify_unknown_ceremony_is_unauthorized() {
        let credential = serde_json::from_value(serde_json::json!({
            "id": "dummy",
            "rawId": "AA",
            "type": "public-key",
            "response": {
                "authenticatorData": "AA",
                "clientDataJSON": "AA",
                "signature": "AA"
            }
        }))
        .expect("credential");
        let response = auth_verify(
            HeaderMap::new(),
            Extension(lazy_pool()),
            Extension(auth_state()),
            Some(Json(PasskeyAuthVerifyRequest {
                authentication_id: Uuid::new_v4().to_string(),
                credential,
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
