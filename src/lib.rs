//! # Tessera (Mobile Identification & Barcode Service)
//!
//! `tessera` is the backend for campus mobile identification: it issues
//! short-lived barcodes that stand in for a physical campus card, and
//! authenticates users with an RSA-challenge password flow or `WebAuthn`
//! passkeys, delivering rotating access/refresh tokens as cookies.
//!
//! ## Login security
//!
//! Passwords never travel in the clear: clients fetch a single-use
//! challenge (a nonce plus the active RSA public key) and submit an
//! OAEP-encrypted `{nonce, password}` payload. Per-IP and per-username
//! throttles, failed-attempt lockouts, and an append-only audit log guard
//! the surface; every client-visible login failure is the same generic
//! message.
//!
//! ## Sessions
//!
//! Access and refresh tokens are HS256 JWTs minted as a pair sharing one
//! `iat` second — the session correlation key. Refresh tokens rotate on
//! use; revoking a session blacklists both halves. The device catalog joins
//! outstanding refresh tokens with audit rows to show where each session
//! came from.
//!
//! ## Barcodes
//!
//! Identification barcodes are 28-digit values re-minted on every issue and
//! locked to the `user` role. School accounts manage dynamic barcodes
//! (14-digit stored values prefixed with a local timestamp at issuance),
//! may share them, and can enable pull mode: automatic selection from a
//! gender-filtered pool with short stickiness. Usage is metered per local
//! day and in total through an append-only transaction ledger.

pub mod api;
pub mod barcode;
pub mod cli;
pub mod keystore;
pub mod token;
pub mod users;
pub mod webauthn;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        // Should be a hex string (full SHA-1 is 40 chars, but could be short)
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
