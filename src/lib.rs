//! # Warden (Authentication & Session Authority)
//!
//! `warden` owns everything a browser front-end needs to move a principal from
//! anonymous to fully authenticated: credential validation, signed session
//! tokens carrying a factor level, a TOTP second factor with QR enrollment,
//! and single-use password-recovery tokens.
//!
//! ## Factor levels
//!
//! A successful password check yields a `primary` token when the account has
//! the second factor enabled and a `verified` token otherwise. A `primary`
//! token opens exactly one door: code verification. Completing verification
//! issues a fresh `verified` token rather than upgrading the old one, so
//! expiry and claims cannot drift.
//!
//! ## Recovery tokens
//!
//! Forgot-password requests always answer 200 to block account enumeration.
//! Issued tokens are stored as SHA-256 hashes, live for 30 minutes, and are
//! consumed with an atomic check-and-set in the same transaction as the
//! password update, so a token can be redeemed at most once even under
//! concurrent requests.

pub mod api;
pub mod cli;
pub mod password;
pub mod token;
pub mod totp;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
