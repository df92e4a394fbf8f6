//! Session/device catalog: enumerate live sessions and revoke them.
//!
//! Sessions are outstanding refresh tokens. Each row is joined with the
//! best-matching successful login audit to recover the device's address and
//! user agent; the match is fuzzy because audit and token writes are not
//! co-transactional. The current session is the row whose mint second is
//! within two seconds of the presented access token's `iat`.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::token::{repo as token_repo, session_jti};

use super::audit;
use super::session::{Authenticated, authenticate, enforce_csrf};
use super::state::AuthState;
use super::types::{DeviceSessionResponse, MessageResponse};
use super::ua;

/// Tolerated skew between an access token's `iat` and the refresh row's
/// mint time when deciding "this is the session making the request".
const CURRENT_IAT_SKEW_SECONDS: i64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum RevokeError {
    #[error("device not found")]
    DeviceNotFound,
    #[error("session already revoked")]
    AlreadyRevoked,
    #[error("cannot revoke the current session")]
    CannotRevokeCurrent,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[utoipa::path(
    get,
    path = "/authn/devices",
    responses(
        (status = 200, description = "Live sessions for the caller", body = [DeviceSessionResponse]),
        (status = 401, description = "Unauthorized", body = String)
    ),
    tag = "devices"
)]
pub async fn list_devices(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let authed = match authenticate(&headers, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };

    match sessions_for(&pool, &authed).await {
        Ok(sessions) => (StatusCode::OK, Json(sessions)).into_response(),
        Err(err) => {
            error!("Failed to enumerate sessions: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

async fn sessions_for(
    pool: &PgPool,
    authed: &Authenticated,
) -> anyhow::Result<Vec<DeviceSessionResponse>> {
    let outstanding = token_repo::list_outstanding(pool, authed.user.id).await?;
    let mut sessions = Vec::with_capacity(outstanding.len());

    for token in outstanding {
        let matched = audit::best_match(pool, authed.user.id, token.created_at).await?;
        let (ip, agent) = matched
            .map(|entry| (entry.ip, entry.user_agent))
            .unwrap_or_default();
        let info = ua::parse(&agent);
        let is_current =
            (token.created_at.timestamp() - authed.claims.iat).abs() <= CURRENT_IAT_SKEW_SECONDS;

        sessions.push(DeviceSessionResponse {
            token_id: token.id,
            created_at: token.created_at,
            expires_at: token.expires_at,
            ip,
            device_name: info.device_name,
            browser: info.browser,
            os: info.os,
            device_type: info.device_type,
            is_current,
        });
    }
    Ok(sessions)
}

#[utoipa::path(
    delete,
    path = "/authn/devices/{token_id}",
    params(("token_id" = Uuid, Path, description = "Outstanding token id")),
    responses(
        (status = 200, description = "Session revoked", body = MessageResponse),
        (status = 400, description = "Cannot revoke the current session", body = String),
        (status = 404, description = "Unknown or already revoked session", body = String)
    ),
    tag = "devices"
)]
pub async fn revoke_device(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Path(token_id): Path<Uuid>,
) -> impl IntoResponse {
    let authed = match authenticate(&headers, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };
    if let Err((status, message)) = enforce_csrf(&headers, &method, authed.transport) {
        return (status, message).into_response();
    }

    match revoke(&pool, &auth_state, &authed, token_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(MessageResponse::new("Session revoked")),
        )
            .into_response(),
        Err(err) => revoke_error_response(&err),
    }
}

#[utoipa::path(
    delete,
    path = "/authn/devices/all",
    responses(
        (status = 200, description = "Every other session revoked", body = MessageResponse),
        (status = 401, description = "Unauthorized", body = String)
    ),
    tag = "devices"
)]
pub async fn revoke_other_devices(
    headers: HeaderMap,
    method: Method,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let authed = match authenticate(&headers, &pool, &auth_state).await {
        Ok(authed) => authed,
        Err((status, message)) => return (status, message).into_response(),
    };
    if let Err((status, message)) = enforce_csrf(&headers, &method, authed.transport) {
        return (status, message).into_response();
    }

    match revoke_others(&pool, &auth_state, &authed).await {
        Ok(count) => (
            StatusCode::OK,
            Json(MessageResponse::new(&format!("Revoked {count} sessions"))),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to revoke other sessions: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

async fn revoke(
    pool: &PgPool,
    auth_state: &AuthState,
    authed: &Authenticated,
    token_id: Uuid,
) -> Result<(), RevokeError> {
    let (token, blacklisted) = token_repo::get_outstanding(pool, authed.user.id, token_id)
        .await?
        .ok_or(RevokeError::DeviceNotFound)?;
    if blacklisted {
        return Err(RevokeError::AlreadyRevoked);
    }
    if (token.created_at.timestamp() - authed.claims.iat).abs() <= CURRENT_IAT_SKEW_SECONDS {
        return Err(RevokeError::CannotRevokeCurrent);
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|err| RevokeError::Internal(err.into()))?;
    token_repo::blacklist_refresh(&mut tx, token.id).await?;
    // Kill the paired access token too: both tokens share the mint second,
    // so the synthetic session jti addresses it exactly.
    let minted = token.created_at.timestamp();
    token_repo::blacklist_access_session(
        &mut tx,
        authed.user.id,
        &session_jti(authed.user.id, minted),
        token.created_at + auth_state.tokens().access_lifetime(),
    )
    .await?;
    tx.commit()
        .await
        .map_err(|err| RevokeError::Internal(err.into()))?;
    Ok(())
}

async fn revoke_others(
    pool: &PgPool,
    auth_state: &AuthState,
    authed: &Authenticated,
) -> anyhow::Result<usize> {
    let outstanding = token_repo::list_outstanding(pool, authed.user.id).await?;
    let mut revoked = 0;
    for token in outstanding {
        match revoke(pool, auth_state, authed, token.id).await {
            Ok(()) => revoked += 1,
            Err(RevokeError::CannotRevokeCurrent | RevokeError::AlreadyRevoked) => {}
            Err(RevokeError::DeviceNotFound) => {}
            Err(RevokeError::Internal(err)) => return Err(err),
        }
    }
    Ok(revoked)
}

fn revoke_error_response(err: &RevokeError) -> axum::response::Response {
    match err {
        RevokeError::DeviceNotFound => {
            (StatusCode::NOT_FOUND, "Device not found".to_string()).into_response()
        }
        RevokeError::AlreadyRevoked => {
            (StatusCode::NOT_FOUND, "Session already revoked".to_string()).into_response()
        }
        RevokeError::CannotRevokeCurrent => (
            StatusCode::BAD_REQUEST,
            "Cannot revoke the current session".to_string(),
        )
            .into_response(),
        RevokeError::Internal(err) => {
            error!("Session revocation failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iat_skew_window_is_two_seconds() {
        assert!((1002_i64 - 1000).abs() <= CURRENT_IAT_SKEW_SECONDS);
        assert!((1000_i64 - 1003).abs() > CURRENT_IAT_SKEW_SECONDS);
    }

    #[test]
    fn revoke_error_statuses() {
        assert_eq!(
            revoke_error_response(&RevokeError::DeviceNotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            revoke_error_response(&RevokeError::AlreadyRevoked).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            revoke_error_response(&RevokeError::CannotRevokeCurrent).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
