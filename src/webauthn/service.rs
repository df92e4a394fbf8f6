//! Passkey ceremony service.
//!
//! Coordinates the two-step `WebAuthn` protocol:
//! 1) Generate challenge options for the browser.
//! 2) Hold the ephemeral ceremony state under a short TTL.
//! 3) Verify the browser's response against the stored state.
//!
//! Ceremony states are single-use: taking one removes it, so concurrent
//! verifiers observe at most one success. Authentication comes in two
//! shapes: targeted (a username hint restricted the credential list) and
//! discoverable (the authenticator identifies the user handle).

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use url::Url;
use uuid::Uuid;
use webauthn_rs::prelude::*;

pub const DEFAULT_CHALLENGE_TTL_SECONDS: u64 = 300;
const RP_NAME: &str = "Tessera";

#[derive(Debug)]
pub enum PasskeyCeremonyError {
    NotFound,
    Expired,
    UserMismatch,
    Webauthn(WebauthnError),
}

struct RegistrationState {
    user_id: Uuid,
    created_at: Instant,
    registration: PasskeyRegistration,
}

enum AuthenticationState {
    /// Challenge built from a known user's credential list.
    Targeted {
        user_id: Uuid,
        authentication: PasskeyAuthentication,
    },
    /// Challenge answerable by any resident credential.
    Discoverable {
        authentication: DiscoverableAuthentication,
    },
}

struct AuthenticationEntry {
    created_at: Instant,
    state: AuthenticationState,
}

/// A consumed authentication ceremony, ready for verification.
pub enum AuthCeremony {
    Targeted {
        user_id: Uuid,
        authentication: PasskeyAuthentication,
    },
    Discoverable {
        authentication: DiscoverableAuthentication,
    },
}

pub struct PasskeyService {
    webauthn: Webauthn,
    challenge_ttl: Duration,
    reg_states: Mutex<HashMap<Uuid, RegistrationState>>,
    auth_states: Mutex<HashMap<Uuid, AuthenticationEntry>>,
}

impl PasskeyService {
    /// Builds the service for the given relying party and allowed origins.
    ///
    /// # Errors
    /// Returns error if the RP id is empty, an origin does not parse, or the
    /// `WebAuthn` builder rejects the configuration.
    pub fn new(rp_id: &str, origins: &[String], challenge_ttl: Duration) -> Result<Self> {
        if rp_id.trim().is_empty() {
            return Err(anyhow!("Passkey RP ID must not be empty"));
        }
        let mut origins = origins.iter();
        let first = origins
            .next()
            .ok_or_else(|| anyhow!("Passkey allowed origins must not be empty"))?;
        let first_url =
            Url::parse(first).with_context(|| format!("Invalid passkey origin: {first}"))?;

        let mut builder = WebauthnBuilder::new(rp_id, &first_url)?.rp_name(RP_NAME);
        for origin in origins {
            let url =
                Url::parse(origin).with_context(|| format!("Invalid passkey origin: {origin}"))?;
            builder = builder.append_allowed_origin(&url);
        }

        Ok(Self {
            webauthn: builder.build()?,
            challenge_ttl,
            reg_states: Mutex::new(HashMap::new()),
            auth_states: Mutex::new(HashMap::new()),
        })
    }

    /// Begins registration, excluding the user's current credential so the
    /// authenticator cannot double-register it.
    ///
    /// # Errors
    /// Returns error if challenge generation fails.
    pub async fn register_begin(
        &self,
        user_id: Uuid,
        username: &str,
        exclude: Option<CredentialID>,
    ) -> Result<(Uuid, CreationChallengeResponse)> {
        let exclude_credentials = exclude.map(|id| vec![id]);
        let (challenge, registration) = self.webauthn.start_passkey_registration(
            user_id,
            username,
            username,
            exclude_credentials,
        )?;

        let reg_id = Uuid::new_v4();
        let mut states = self.reg_states.lock().await;
        states.retain(|_, entry| entry.created_at.elapsed() < self.challenge_ttl);
        states.insert(
            reg_id,
            RegistrationState {
                user_id,
                created_at: Instant::now(),
                registration,
            },
        );

        Ok((reg_id, challenge))
    }

    /// Finishes registration. The ceremony state is consumed either way.
    ///
    /// # Errors
    /// Returns `PasskeyCeremonyError` if the state is missing, expired,
    /// bound to another user, or the response does not verify.
    pub async fn register_finish(
        &self,
        reg_id: Uuid,
        user_id: Uuid,
        response: &RegisterPublicKeyCredential,
    ) -> Result<Passkey, PasskeyCeremonyError> {
        let state = {
            let mut states = self.reg_states.lock().await;
            states.remove(&reg_id).ok_or(PasskeyCeremonyError::NotFound)?
        };

        if state.created_at.elapsed() >= self.challenge_ttl {
            return Err(PasskeyCeremonyError::Expired);
        }
        if state.user_id != user_id {
            return Err(PasskeyCeremonyError::UserMismatch);
        }

        self.webauthn
            .finish_passkey_registration(response, &state.registration)
            .map_err(PasskeyCeremonyError::Webauthn)
    }

    /// Begins authentication restricted to one user's credential.
    ///
    /// # Errors
    /// Returns error if challenge generation fails.
    pub async fn auth_begin_targeted(
        &self,
        user_id: Uuid,
        passkey: &Passkey,
    ) -> Result<(Uuid, RequestChallengeResponse)> {
        let (challenge, authentication) = self
            .webauthn
            .start_passkey_authentication(std::slice::from_ref(passkey))?;
        let auth_id = self
            .store_auth(AuthenticationState::Targeted {
                user_id,
                authentication,
            })
            .await;
        Ok((auth_id, challenge))
    }

    /// Begins a discoverable (username-less) authentication.
    ///
    /// # Errors
    /// Returns error if challenge generation fails.
    pub async fn auth_begin_discoverable(&self) -> Result<(Uuid, RequestChallengeResponse)> {
        let (challenge, authentication) = self.webauthn.start_discoverable_authentication()?;
        let auth_id = self
            .store_auth(AuthenticationState::Discoverable { authentication })
            .await;
        Ok((auth_id, challenge))
    }

    /// Consumes a pending authentication ceremony.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids, `Expired` past the TTL.
    pub async fn take_auth(&self, auth_id: Uuid) -> Result<AuthCeremony, PasskeyCeremonyError> {
        let entry = {
            let mut states = self.auth_states.lock().await;
            states.remove(&auth_id).ok_or(PasskeyCeremonyError::NotFound)?
        };
        if entry.created_at.elapsed() >= self.challenge_ttl {
            return Err(PasskeyCeremonyError::Expired);
        }
        Ok(match entry.state {
            AuthenticationState::Targeted {
                user_id,
                authentication,
            } => AuthCeremony::Targeted {
                user_id,
                authentication,
            },
            AuthenticationState::Discoverable { authentication } => {
                AuthCeremony::Discoverable { authentication }
            }
        })
    }

    /// Verifies a targeted authentication response.
    ///
    /// # Errors
    /// Returns the verifier error when the assertion does not check out.
    pub fn finish_targeted(
        &self,
        response: &PublicKeyCredential,
        authentication: &PasskeyAuthentication,
    ) -> Result<AuthenticationResult, WebauthnError> {
        self.webauthn
            .finish_passkey_authentication(response, authentication)
    }

    /// Extracts the user handle claimed by a discoverable assertion.
    ///
    /// # Errors
    /// Returns the verifier error when the response carries no user handle.
    pub fn identify_discoverable(
        &self,
        response: &PublicKeyCredential,
    ) -> Result<Uuid, WebauthnError> {
        self.webauthn
            .identify_discoverable_authentication(response)
            .map(|(user_id, _cred_id)| user_id)
    }

    /// Verifies a discoverable authentication response against the
    /// identified user's credentials.
    ///
    /// # Errors
    /// Returns the verifier error when the assertion does not check out.
    pub fn finish_discoverable(
        &self,
        response: &PublicKeyCredential,
        authentication: DiscoverableAuthentication,
        credentials: &[DiscoverableKey],
    ) -> Result<AuthenticationResult, WebauthnError> {
        self.webauthn
            .finish_discoverable_authentication(response, authentication, credentials)
    }

    async fn store_auth(&self, state: AuthenticationState) -> Uuid {
        let auth_id = Uuid::new_v4();
        let mut states = self.auth_states.lock().await;
        states.retain(|_, entry| entry.created_at.elapsed() < self.challenge_ttl);
        states.insert(
            auth_id,
            AuthenticationEntry {
                created_at: Instant::now(),
                state,
            },
        );
        auth_id
    }
}

/// Serialize a passkey for storage.
///
/// # Errors
/// Returns error if serialization fails.
pub fn serialize_passkey(passkey: &Passkey) -> Result<Vec<u8>> {
    serde_json::to_vec(passkey).context("Failed to serialize passkey")
}

/// Deserialize a stored passkey.
///
/// # Errors
/// Returns error if deserialization fails.
pub fn deserialize_passkey(data: &[u8]) -> Result<Passkey> {
    serde_json::from_slice(data).context("Failed to deserialize passkey")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> Result<PasskeyService> {
        PasskeyService::new(
            "example.com",
            &["https://example.com".to_string()],
            Duration::from_secs(120),
        )
    }

    #[test]
    fn rejects_empty_rp_id() {
        let result = PasskeyService::new(
            " ",
            &["https://example.com".to_string()],
            Duration::from_secs(120),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_empty_origins() {
        let result = PasskeyService::new("example.com", &[], Duration::from_secs(120));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_invalid_origin() {
        let result = PasskeyService::new(
            "example.com",
            &["not a url".to_string()],
            Duration::from_secs(120),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn registration_state_is_single_use() -> Result<()> {
        let service = test_service()?;
        let user_id = Uuid::new_v4();
        let (reg_id, _challenge) = service.register_begin(user_id, "alice", None).await?;

        let mut states = service.reg_states.lock().await;
        assert!(states.remove(&reg_id).is_some());
        assert!(states.remove(&reg_id).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn take_auth_consumes_the_state() -> Result<()> {
        let service = test_service()?;
        let (auth_id, _challenge) = service.auth_begin_discoverable().await?;

        assert!(service.take_auth(auth_id).await.is_ok());
        let second = service.take_auth(auth_id).await;
        assert!(matches!(second, Err(PasskeyCeremonyError::NotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn expired_auth_state_is_rejected() -> Result<()> {
        let service = PasskeyService::new(
            "example.com",
            &["https://example.com".to_string()],
            Duration::from_secs(0),
        )?;
        let (auth_id, _challenge) = service.auth_begin_discoverable().await?;
        // A zero TTL expires the state immediately; the prune in store_auth
        // may already have dropped it.
        let result = service.take_auth(auth_id).await;
        assert!(matches!(
            result,
            Err(PasskeyCeremonyError::Expired | PasskeyCeremonyError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn register_finish_rejects_user_mismatch() -> Result<()> {
        let service = test_service()?;
        let user_id = Uuid::new_v4();
        let (reg_id, _challenge) = service.register_begin(user_id, "alice", None).await?;

        let credential = serde_json::from_value(serde_json::json!({
            "id": "dummy",
            "rawId": "AA",
            "type": "public-key",
            "response": {
                "attestationObject": "AA",
                "clientDataJSON": "AA"
            }
        }))?;
        let err = service
            .register_finish(reg_id, Uuid::new_v4(), &credential)
            .await
            .err()
            .ok_or_else(|| anyhow!("expected user mismatch"))?;
        assert!(matches!(err, PasskeyCeremonyError::UserMismatch));
        Ok(())
    }
}
