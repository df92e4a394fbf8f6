//! Auth configuration and shared state.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::api::handlers::auth::rate_limit::RateLimiter;
use crate::barcode::engine::IssuanceEngine;
use crate::keystore::KeyStore;
use crate::token::{
    DEFAULT_ACCESS_LIFETIME_MINUTES, DEFAULT_REFRESH_LIFETIME_DAYS, TokenService,
};
use crate::webauthn::PasskeyService;
use crate::webauthn::service::DEFAULT_CHALLENGE_TTL_SECONDS;

const DEFAULT_MAX_FAILED_LOGIN_ATTEMPTS: i32 = 5;
const DEFAULT_LOCKOUT_MINUTES: i64 = 30;
const DEFAULT_LOGIN_CHALLENGE_TTL_SECONDS: i64 = 120;
const DEFAULT_LOGIN_CHALLENGE_NONCE_BYTES: usize = 16;
const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    backend_origin: String,
    frontend_origins: Vec<String>,
    webauthn_rp_id: Option<String>,
    max_failed_login_attempts: i32,
    account_lockout_minutes: i64,
    login_challenge_ttl_seconds: i64,
    login_challenge_nonce_bytes: usize,
    passkey_challenge_ttl_seconds: u64,
    access_token_lifetime_minutes: i64,
    refresh_token_lifetime_days: i64,
    cookie_secure: Option<bool>,
    timezone: Tz,
}

impl AuthConfig {
    #[must_use]
    pub fn new(backend_origin: String) -> Self {
        Self {
            backend_origin,
            frontend_origins: Vec::new(),
            webauthn_rp_id: None,
            max_failed_login_attempts: DEFAULT_MAX_FAILED_LOGIN_ATTEMPTS,
            account_lockout_minutes: DEFAULT_LOCKOUT_MINUTES,
            login_challenge_ttl_seconds: DEFAULT_LOGIN_CHALLENGE_TTL_SECONDS,
            login_challenge_nonce_bytes: DEFAULT_LOGIN_CHALLENGE_NONCE_BYTES,
            passkey_challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            access_token_lifetime_minutes: DEFAULT_ACCESS_LIFETIME_MINUTES,
            refresh_token_lifetime_days: DEFAULT_REFRESH_LIFETIME_DAYS,
            cookie_secure: None,
            timezone: DEFAULT_TIMEZONE,
        }
    }

    #[must_use]
    pub fn with_frontend_origins(mut self, origins: Vec<String>) -> Self {
        self.frontend_origins = origins;
        self
    }

    #[must_use]
    pub fn with_webauthn_rp_id(mut self, rp_id: Option<String>) -> Self {
        self.webauthn_rp_id = rp_id;
        self
    }

    #[must_use]
    pub fn with_max_failed_login_attempts(mut self, attempts: i32) -> Self {
        self.max_failed_login_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_account_lockout_minutes(mut self, minutes: i64) -> Self {
        self.account_lockout_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_login_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.login_challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_login_challenge_nonce_bytes(mut self, bytes: usize) -> Self {
        self.login_challenge_nonce_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_passkey_challenge_ttl_seconds(mut self, seconds: u64) -> Self {
        self.passkey_challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_access_token_lifetime_minutes(mut self, minutes: i64) -> Self {
        self.access_token_lifetime_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_refresh_token_lifetime_days(mut self, days: i64) -> Self {
        self.refresh_token_lifetime_days = days;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: Option<bool>) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    #[must_use]
    pub fn backend_origin(&self) -> &str {
        &self.backend_origin
    }

    #[must_use]
    pub fn frontend_origins(&self) -> &[String] {
        &self.frontend_origins
    }

    /// Relying-party id: explicit override, else the backend origin's host.
    #[must_use]
    pub fn webauthn_rp_id(&self) -> String {
        if let Some(rp_id) = &self.webauthn_rp_id {
            return rp_id.clone();
        }
        Url::parse(&self.backend_origin)
            .ok()
            .and_then(|url| url.host_str().map(ToString::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Origins a `WebAuthn` response may come from: backend plus frontends.
    #[must_use]
    pub fn allowed_origins(&self) -> Vec<String> {
        let mut origins = vec![self.backend_origin.trim_end_matches('/').to_string()];
        for origin in &self.frontend_origins {
            let origin = origin.trim_end_matches('/').to_string();
            if !origins.contains(&origin) {
                origins.push(origin);
            }
        }
        origins
    }

    #[must_use]
    pub fn max_failed_login_attempts(&self) -> i32 {
        self.max_failed_login_attempts
    }

    #[must_use]
    pub fn account_lockout_minutes(&self) -> i64 {
        self.account_lockout_minutes
    }

    #[must_use]
    pub fn login_challenge_ttl_seconds(&self) -> i64 {
        self.login_challenge_ttl_seconds
    }

    #[must_use]
    pub fn login_challenge_nonce_bytes(&self) -> usize {
        self.login_challenge_nonce_bytes
    }

    #[must_use]
    pub fn passkey_challenge_ttl_seconds(&self) -> u64 {
        self.passkey_challenge_ttl_seconds
    }

    #[must_use]
    pub fn access_token_lifetime_minutes(&self) -> i64 {
        self.access_token_lifetime_minutes
    }

    #[must_use]
    pub fn refresh_token_lifetime_days(&self) -> i64 {
        self.refresh_token_lifetime_days
    }

    /// Cookies are marked Secure behind HTTPS unless explicitly overridden.
    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
            .unwrap_or_else(|| self.backend_origin.starts_with("https://"))
    }

    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

pub struct AuthState {
    config: AuthConfig,
    rate_limiter: Arc<dyn RateLimiter>,
    keys: KeyStore,
    tokens: TokenService,
    passkeys: PasskeyService,
    engine: IssuanceEngine,
}

impl AuthState {
    /// Wires the service bundle from configuration.
    ///
    /// # Errors
    /// Returns error if the passkey service rejects the RP configuration.
    pub fn new(
        config: AuthConfig,
        jwt_secret: SecretString,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Result<Self> {
        let passkeys = PasskeyService::new(
            &config.webauthn_rp_id(),
            &config.allowed_origins(),
            Duration::from_secs(config.passkey_challenge_ttl_seconds()),
        )
        .context("failed to build passkey service")?;
        let tokens = TokenService::new(
            jwt_secret,
            config.access_token_lifetime_minutes(),
            config.refresh_token_lifetime_days(),
        );
        let engine = IssuanceEngine::new(config.timezone());

        Ok(Self {
            config,
            rate_limiter,
            keys: KeyStore::new(),
            tokens,
            passkeys,
            engine,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub(crate) fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    #[must_use]
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[must_use]
    pub fn passkeys(&self) -> &PasskeyService {
        &self.passkeys
    }

    #[must_use]
    pub fn engine(&self) -> &IssuanceEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::rate_limit::NoopRateLimiter;

    #[test]
    fn auth_config_defaults() {
        let config = AuthConfig::new("https://id.campus.edu".to_string());
        assert_eq!(config.max_failed_login_attempts(), 5);
        assert_eq!(config.account_lockout_minutes(), 30);
        assert_eq!(config.login_challenge_ttl_seconds(), 120);
        assert_eq!(config.login_challenge_nonce_bytes(), 16);
        assert_eq!(config.passkey_challenge_ttl_seconds(), 300);
        assert_eq!(config.access_token_lifetime_minutes(), 30);
        assert_eq!(config.refresh_token_lifetime_days(), 7);
        assert_eq!(config.timezone(), chrono_tz::America::Los_Angeles);
        assert!(config.cookie_secure());
    }

    #[test]
    fn rp_id_derives_from_backend_origin() {
        let config = AuthConfig::new("https://id.campus.edu:8443".to_string());
        assert_eq!(config.webauthn_rp_id(), "id.campus.edu");

        let config = config.with_webauthn_rp_id(Some("campus.edu".to_string()));
        assert_eq!(config.webauthn_rp_id(), "campus.edu");
    }

    #[test]
    fn allowed_origins_dedupe_and_trim() {
        let config = AuthConfig::new("https://id.campus.edu".to_string()).with_frontend_origins(
            vec![
                "https://app.campus.edu/".to_string(),
                "https://id.campus.edu".to_string(),
            ],
        );
        assert_eq!(
            config.allowed_origins(),
            vec![
                "https://id.campus.edu".to_string(),
                "https://app.campus.edu".to_string(),
            ]
        );
    }

    #[test]
    fn cookie_secure_follows_scheme_unless_overridden() {
        let config = AuthConfig::new("http://localhost:8080".to_string());
        assert!(!config.cookie_secure());
        let config = config.with_cookie_secure(Some(true));
        assert!(config.cookie_secure());
    }

    #[test]
    fn auth_state_builds_with_noop_limiter() {
        let config = AuthConfig::new("https://id.campus.edu".to_string());
        let state = AuthState::new(
            config,
            SecretString::from("secret"),
            Arc::new(NoopRateLimiter),
        );
        assert!(state.is_ok());
    }
}
