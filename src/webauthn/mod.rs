//! Passkey (`WebAuthn`) support: ceremony service, credential storage.

pub mod models;
pub mod repo;
pub mod service;

pub use service::{PasskeyCeremonyError, PasskeyService};
