//! Session token issuance and validation.
//!
//! Tokens are HS256-signed JWTs carrying the subject, issue/expiry instants,
//! a unique token id, and the factor level the session has satisfied.
//! Validation is entirely local: a pure function of the token, the signing
//! key, and the clock. Logout is handled with a jti-keyed denylist whose
//! entries live for the remaining token lifetime.

use anyhow::{anyhow, Result};
use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

/// How many authentication steps a token has satisfied.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FactorLevel {
    /// Password only; grants access to second-factor verification and nothing else.
    Primary,
    /// Password plus second factor (or no second factor enrolled).
    Verified,
}

impl FactorLevel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Verified => "verified",
        }
    }

    pub(crate) fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "primary" => Some(Self::Primary),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }
}

/// Claims encoded into every session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub fct: String,
}

/// Why a presented token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token malformed")]
    Malformed,
    #[error("token signature invalid")]
    SignatureInvalid,
    #[error("token revoked")]
    Revoked,
}

/// A freshly minted token plus the claims it carries.
#[derive(Debug)]
pub struct IssuedToken {
    pub jwt: String,
    pub jti: Uuid,
    pub expires_at: i64,
}

/// The decoded view of a valid token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedToken {
    pub subject: Uuid,
    pub factor: FactorLevel,
    pub jti: Uuid,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: i64,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(signing_key: &SecretString, ttl_seconds: i64) -> Self {
        let key_bytes = signing_key.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(key_bytes),
            decoding: DecodingKey::from_secret(key_bytes),
            ttl_seconds,
        }
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Mint a token for the subject at the given factor level.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn issue(&self, subject: Uuid, factor: FactorLevel) -> Result<IssuedToken> {
        self.issue_at(subject, factor, Utc::now().timestamp())
    }

    /// Mint a token with an explicit issue instant. Used directly by tests.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn issue_at(&self, subject: Uuid, factor: FactorLevel, now: i64) -> Result<IssuedToken> {
        let jti = Uuid::new_v4();
        let expires_at = now + self.ttl_seconds;
        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp: expires_at,
            jti: jti.to_string(),
            fct: factor.as_str().to_string(),
        };
        let jwt = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|err| anyhow!("failed to sign session token: {err}"))?;
        Ok(IssuedToken {
            jwt,
            jti,
            expires_at,
        })
    }

    /// Validate a presented token against the signing key and the clock.
    ///
    /// # Errors
    /// Returns the rejection kind: expired, malformed, or a bad signature.
    pub fn validate(&self, token: &str) -> Result<ValidatedToken, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::SignatureInvalid,
                _ => TokenError::Malformed,
            }
        })?;

        let claims = data.claims;
        let subject = Uuid::parse_str(&claims.sub).map_err(|_| TokenError::Malformed)?;
        let jti = Uuid::parse_str(&claims.jti).map_err(|_| TokenError::Malformed)?;
        let factor = FactorLevel::from_str(&claims.fct).ok_or(TokenError::Malformed)?;

        Ok(ValidatedToken {
            subject,
            factor,
            jti,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }
}

/// In-process revocation list keyed by token id.
///
/// Entries expire with the token they block, so the map never outgrows the
/// set of live revoked tokens. Cross-instance revocation is a documented
/// limitation; a multi-node deployment would move this into the database.
#[derive(Debug, Default)]
pub struct Denylist {
    entries: Mutex<HashMap<Uuid, i64>>,
}

impl Denylist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a token id as revoked until its expiry instant.
    pub fn revoke(&self, jti: Uuid, expires_at: i64, now: i64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, expiry| *expiry > now);
            entries.insert(jti, expires_at);
        }
    }

    /// Whether the token id is currently revoked.
    pub fn contains(&self, jti: Uuid, now: i64) -> bool {
        match self.entries.lock() {
            Ok(entries) => entries.get(&jti).is_some_and(|expiry| *expiry > now),
            // A poisoned lock fails closed: treat everything as revoked.
            Err(_) => true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(&SecretString::from("test-signing-key"), 3600)
    }

    #[test]
    fn factor_level_round_trips() {
        assert_eq!(
            FactorLevel::from_str(FactorLevel::Primary.as_str()),
            Some(FactorLevel::Primary)
        );
        assert_eq!(
            FactorLevel::from_str(FactorLevel::Verified.as_str()),
            Some(FactorLevel::Verified)
        );
        assert_eq!(FactorLevel::from_str("other"), None);
    }

    #[test]
    fn issue_and_validate_round_trip() {
        let issuer = issuer();
        let subject = Uuid::new_v4();
        let issued = issuer.issue(subject, FactorLevel::Verified).unwrap();

        let validated = issuer.validate(&issued.jwt).unwrap();
        assert_eq!(validated.subject, subject);
        assert_eq!(validated.factor, FactorLevel::Verified);
        assert_eq!(validated.jti, issued.jti);
        assert_eq!(validated.expires_at, issued.expires_at);
    }

    #[test]
    fn primary_factor_survives_the_claims() {
        let issuer = issuer();
        let issued = issuer.issue(Uuid::new_v4(), FactorLevel::Primary).unwrap();
        let validated = issuer.validate(&issued.jwt).unwrap();
        assert_eq!(validated.factor, FactorLevel::Primary);
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = issuer();
        let past = Utc::now().timestamp() - 7200;
        let issued = issuer
            .issue_at(Uuid::new_v4(), FactorLevel::Verified, past)
            .unwrap();
        assert_eq!(issuer.validate(&issued.jwt), Err(TokenError::Expired));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let issuer = issuer();
        let issued = issuer.issue(Uuid::new_v4(), FactorLevel::Verified).unwrap();

        let other = TokenIssuer::new(&SecretString::from("different-key"), 3600);
        assert_eq!(
            other.validate(&issued.jwt),
            Err(TokenError::SignatureInvalid)
        );
    }

    #[test]
    fn garbage_token_is_malformed() {
        let issuer = issuer();
        assert_eq!(issuer.validate("not-a-jwt"), Err(TokenError::Malformed));
        assert_eq!(issuer.validate(""), Err(TokenError::Malformed));
    }

    #[test]
    fn denylist_blocks_until_expiry() {
        let denylist = Denylist::new();
        let jti = Uuid::new_v4();
        let now = Utc::now().timestamp();

        assert!(!denylist.contains(jti, now));
        denylist.revoke(jti, now + 60, now);
        assert!(denylist.contains(jti, now));
        // Once the token itself is dead the entry no longer matters.
        assert!(!denylist.contains(jti, now + 61));
    }

    #[test]
    fn denylist_prunes_dead_entries_on_revoke() {
        let denylist = Denylist::new();
        let now = Utc::now().timestamp();
        let old = Uuid::new_v4();
        denylist.revoke(old, now + 1, now);

        let fresh = Uuid::new_v4();
        denylist.revoke(fresh, now + 100, now + 10);

        let entries = denylist.entries.lock().unwrap();
        assert!(!entries.contains_key(&old));
        assert!(entries.contains_key(&fresh));
    }
}
