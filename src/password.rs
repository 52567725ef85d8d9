//! Password hashing and strength policy.
//!
//! Passwords are stored only as Argon2id PHC strings; plaintext never touches
//! the database. Verification for unknown users burns an equivalent amount of
//! work so signin latency does not reveal whether a username exists.

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use rand::rngs::OsRng;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

// Fixed salt used only for the timing-equalizing dummy verification.
const DUMMY_SALT: &[u8] = b"warden-dummy-pad";

/// Hash a plaintext password into an Argon2id PHC string.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?
        .to_string();
    Ok(hash)
}

/// Verify a plaintext password against a stored PHC string.
///
/// Returns `Ok(false)` on mismatch; an error only for an unparseable hash.
///
/// # Errors
/// Returns an error if the stored hash is not a valid PHC string.
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(stored_hash).map_err(|err| anyhow!("invalid password hash: {err}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Burn one hash computation's worth of work for unknown users.
pub fn verify_dummy(password: &str) {
    if let Ok(salt) = SaltString::encode_b64(DUMMY_SALT) {
        let _ = Argon2::default().hash_password(password.as_bytes(), &salt);
    }
}

/// Check the password against the strength policy.
///
/// # Errors
/// Returns the rejection reason for a weak password.
pub fn check_strength(password: &str) -> Result<(), &'static str> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err("Password must be at least 8 characters long");
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err("Password must be at most 128 characters long");
    }
    if !password.chars().any(char::is_alphabetic) {
        return Err("Password must contain at least one letter");
    }
    if !password.chars().any(|ch| ch.is_ascii_digit()) {
        return Err("Password must contain at least one digit");
    }
    Ok(())
}
