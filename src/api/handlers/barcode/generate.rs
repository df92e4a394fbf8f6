//! `POST /generate_barcode`.
//!
//! Wire contract is legacy: policy rejections (no selection, limits,
//! non-shareable barcode) answer HTTP 200 with `status: "error"`, while
//! authentication and role failures use real status codes.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::barcode::{IssueError, IssueOutcome};

use super::super::auth::challenge::throttled;
use super::super::auth::rate_limit::{Decision, Scope};
use super::super::auth::session::{authenticate, enforce_csrf};
use super::super::auth::state::AuthState;
use super::super::auth::types::GenerateBarcodeResponse;

#[utoipa::path(
    post,
    path = "/generate_barcode",
    responses(
        (status = 200, description = "Issued barcode or policy rejection", body = GenerateBarcodeResponse),
        (status = 401, description = "Unauthorized", body = String),
        (status = 403, description = "Role may not issue barcodes", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "barcode"
)]
pub async fn generate_barcode(
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
    if let Decision::Limited { retry_after_secs } = auth_state
        .rate_limiter()
        .check(Scope::BarcodeGeneration, &authed.user.id.to_string())
    {
        return throttled(retry_after_secs);
    }

    match auth_state.engine().issue(&pool, &authed.user).await {
        Ok(IssueOutcome::Issued(issued)) => (
            StatusCode::OK,
            Json(GenerateBarcodeResponse::success(
                issued.barcode_type,
                issued.barcode,
                issued.message,
            )),
        )
            .into_response(),
        Ok(IssueOutcome::Rejected(message)) => {
            (StatusCode::OK, Json(GenerateBarcodeResponse::error(message))).into_response()
        }
        Err(IssueError::PermissionDenied) => {
            (StatusCode::FORBIDDEN, "Permission Denied.".to_string()).into_response()
        }
        Err(IssueError::Internal(err)) => {
            error!("Barcode issuance failed: {err}");
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

    #[tokio::test]
    async fn generate_requires_authentication() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .expect("lazy pool");
        let response = generate_barcode(
            HeaderMap::new(),
            Method::POST,
            Extension(pool),
            Extension(auth_state()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
