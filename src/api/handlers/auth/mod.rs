//! Authentication surface: challenge/login, tokens, sessions, passkeys,
//! registration, profile.

pub mod audit;
pub mod challenge;
pub mod devices;
pub mod lockout;
pub mod login;
pub mod passkeys;
pub mod password;
pub mod profile;
pub mod rate_limit;
pub mod register;
pub mod session;
pub mod state;
pub mod tokens;
pub mod types;
pub mod ua;
pub(crate) mod utils;

pub use rate_limit::{NoopRateLimiter, RateLimiter, SlidingWindowLimiter};
pub use state::{AuthConfig, AuthState};
