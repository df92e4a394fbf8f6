//! Command-line argument dispatch.
//!
//! Maps validated CLI matches to an action: the API server, or an offline
//! key rotation.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::str::FromStr;

use crate::api::handlers::auth::AuthConfig;
use crate::cli::actions::{Action, server::Args};
use crate::cli::commands;

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    if matches.get_flag(commands::ARG_ROTATE_KEYS) {
        let key_size = matches
            .get_one::<String>(commands::ARG_KEY_SIZE)
            .map(String::as_str)
            .unwrap_or("2048")
            .parse::<usize>()
            .context("invalid --key-size")?;
        return Ok(Action::RotateKeys { dsn, key_size });
    }

    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let backend_origin = matches
        .get_one::<String>(commands::ARG_BACKEND_ORIGIN)
        .cloned()
        .context("missing required argument: --backend-origin")?;
    let jwt_secret = matches
        .get_one::<String>(commands::ARG_JWT_SECRET)
        .cloned()
        .context("missing required argument: --jwt-secret")?;

    let frontend_origins = matches
        .get_one::<String>(commands::ARG_FRONTEND_ORIGINS)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let timezone_name = matches
        .get_one::<String>(commands::ARG_TIMEZONE)
        .map(String::as_str)
        .unwrap_or("America/Los_Angeles");
    let timezone = chrono_tz::Tz::from_str(timezone_name)
        .map_err(|err| anyhow::anyhow!("invalid --timezone {timezone_name}: {err}"))?;

    let mut auth_config = AuthConfig::new(backend_origin)
        .with_frontend_origins(frontend_origins)
        .with_webauthn_rp_id(matches.get_one::<String>(commands::ARG_WEBAUTHN_RP_ID).cloned())
        .with_cookie_secure(matches.get_one::<bool>(commands::ARG_COOKIE_SECURE).copied())
        .with_timezone(timezone);

    if let Some(attempts) = matches.get_one::<i32>(commands::ARG_MAX_FAILED_LOGIN_ATTEMPTS) {
        auth_config = auth_config.with_max_failed_login_attempts(*attempts);
    }
    if let Some(minutes) = matches.get_one::<i64>(commands::ARG_ACCOUNT_LOCKOUT_MINUTES) {
        auth_config = auth_config.with_account_lockout_minutes(*minutes);
    }
    if let Some(seconds) = matches.get_one::<i64>(commands::ARG_LOGIN_CHALLENGE_TTL_SECONDS) {
        auth_config = auth_config.with_login_challenge_ttl_seconds(*seconds);
    }
    if let Some(bytes) = matches.get_one::<usize>(commands::ARG_LOGIN_CHALLENGE_NONCE_BYTES) {
        auth_config = auth_config.with_login_challenge_nonce_bytes(*bytes);
    }
    if let Some(seconds) = matches.get_one::<u64>(commands::ARG_PASSKEY_CHALLENGE_TTL_SECONDS) {
        auth_config = auth_config.with_passkey_challenge_ttl_seconds(*seconds);
    }
    if let Some(minutes) = matches.get_one::<i64>(commands::ARG_ACCESS_TOKEN_LIFETIME_MINUTES) {
        auth_config = auth_config.with_access_token_lifetime_minutes(*minutes);
    }
    if let Some(days) = matches.get_one::<i64>(commands::ARG_REFRESH_TOKEN_LIFETIME_DAYS) {
        auth_config = auth_config.with_refresh_token_lifetime_days(*days);
    }

    Ok(Action::Server(Args {
        port,
        dsn,
        auth_config,
        jwt_secret: SecretString::from(jwt_secret),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "tessera",
            "--dsn",
            "postgres://user@localhost:5432/tessera",
            "--backend-origin",
            "https://id.campus.edu",
            "--jwt-secret",
            "secret",
        ]
    }

    #[test]
    fn server_action_with_defaults() {
        let matches = crate::cli::commands::new().get_matches_from(base_args());
        let action = handler(&matches).expect("action");
        match action {
            Action::Server(args) => {
                assert_eq!(args.port, 8080);
                assert_eq!(args.auth_config.backend_origin(), "https://id.campus.edu");
                assert_eq!(
                    args.auth_config.timezone(),
                    chrono_tz::America::Los_Angeles
                );
            }
            Action::RotateKeys { .. } => panic!("expected server action"),
        }
    }

    #[test]
    fn rotate_keys_action() {
        let mut args = base_args();
        args.extend(["--rotate-keys", "--key-size", "4096"]);
        let matches = crate::cli::commands::new().get_matches_from(args);
        let action = handler(&matches).expect("action");
        match action {
            Action::RotateKeys { dsn, key_size } => {
                assert_eq!(dsn, "postgres://user@localhost:5432/tessera");
                assert_eq!(key_size, 4096);
            }
            Action::Server(_) => panic!("expected rotate action"),
        }
    }

    #[test]
    fn invalid_timezone_is_rejected() {
        let mut args = base_args();
        args.extend(["--timezone", "Mars/Olympus_Mons"]);
        let matches = crate::cli::commands::new().get_matches_from(args);
        assert!(handler(&matches).is_err());
    }

    #[test]
    fn frontend_origins_are_split_and_trimmed() {
        let mut args = base_args();
        args.extend([
            "--frontend-origins",
            "https://app.campus.edu, https://beta.campus.edu ,",
        ]);
        let matches = crate::cli::commands::new().get_matches_from(args);
        let action = handler(&matches).expect("action");
        match action {
            Action::Server(server_args) => {
                assert_eq!(
                    server_args.auth_config.frontend_origins(),
                    &[
                        "https://app.campus.edu".to_string(),
                        "https://beta.campus.edu".to_string(),
                    ]
                );
            }
            Action::RotateKeys { .. } => panic!("expected server action"),
        }
    }
}
