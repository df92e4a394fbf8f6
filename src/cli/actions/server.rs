use anyhow::Result;
use secrecy::SecretString;
use std::sync::Arc;

use crate::api;
use crate::api::handlers::auth::{AuthConfig, AuthState, SlidingWindowLimiter};

/// Everything the server action needs, resolved from CLI/env.
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub auth_config: AuthConfig,
    pub jwt_secret: SecretString,
}

/// Build the shared state and serve.
///
/// # Errors
/// Returns error if state construction or the server fails.
pub async fn run(args: Args) -> Result<()> {
    let auth_state = Arc::new(AuthState::new(
        args.auth_config,
        args.jwt_secret,
        Arc::new(SlidingWindowLimiter::new()),
    )?);
    api::new(args.port, args.dsn, auth_state).await
}
