//! Code generation parameters and verification for the TOTP second factor.
//!
//! RFC 6238 with the parameters every major authenticator app assumes:
//! SHA-1, six digits, a 30-second step, and one step of skew either way.
//! Verification reports WHICH step a code matched so the replay cache can
//! pin a code to its own window instead of the wall-clock one.

use anyhow::{anyhow, Result};
use totp_rs::{Algorithm, Secret, TOTP};

pub const TOTP_DIGITS: usize = 6;
pub const TOTP_SKEW: u64 = 1;
pub const TOTP_STEP_SECONDS: u64 = 30;

/// Everything a client needs to load the secret into an authenticator app.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub secret_base32: String,
    pub otpauth_url: String,
    /// `data:image/png;base64,...` QR encoding of the otpauth URL.
    pub qr_data_url: String,
}

#[derive(Clone)]
pub struct TotpEngine {
    issuer: String,
}

impl TotpEngine {
    #[must_use]
    pub fn new(issuer: String) -> Self {
        Self { issuer }
    }

    fn build(&self, secret_bytes: Vec<u8>, account: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            1,
            TOTP_STEP_SECONDS,
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|err| anyhow!("TOTP init error: {err}"))
    }

    fn build_from_base32(&self, secret_base32: &str, account: &str) -> Result<TOTP> {
        let secret_bytes = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|err| anyhow!("invalid TOTP secret encoding: {err}"))?;
        self.build(secret_bytes, account)
    }

    /// Generate a fresh secret and the provisioning material for it.
    ///
    /// # Errors
    /// Returns an error if secret generation or QR rendering fails.
    pub fn begin_enrollment(&self, account: &str) -> Result<Enrollment> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|err| anyhow!("secret generation error: {err}"))?;
        let totp = self.build(secret_bytes, account)?;
        Self::enrollment_from(&totp)
    }

    /// Rebuild the provisioning material for an already stored secret.
    ///
    /// # Errors
    /// Returns an error if the stored secret does not decode or QR rendering fails.
    pub fn provision(&self, secret_base32: &str, account: &str) -> Result<Enrollment> {
        let totp = self.build_from_base32(secret_base32, account)?;
        Self::enrollment_from(&totp)
    }

    fn enrollment_from(totp: &TOTP) -> Result<Enrollment> {
        let qr = totp
            .get_qr_base64()
            .map_err(|err| anyhow!("QR generation error: {err}"))?;
        Ok(Enrollment {
            secret_base32: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
            qr_data_url: format!("data:image/png;base64,{qr}"),
        })
    }

    /// Check a code against the secret at an explicit instant.
    ///
    /// Accepts the current 30-second step plus one step either side, and on
    /// success returns the step index the code was generated for. `Ok(None)`
    /// means the code is wrong or outside the skew window.
    ///
    /// # Errors
    /// Returns an error only if the stored secret does not decode.
    pub fn verify_at(
        &self,
        secret_base32: &str,
        code: &str,
        timestamp: u64,
    ) -> Result<Option<u64>> {
        if code.len() != TOTP_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }

        let totp = self.build_from_base32(secret_base32, "account")?;
        let current = timestamp / TOTP_STEP_SECONDS;
        for step in current.saturating_sub(TOTP_SKEW)..=current + TOTP_SKEW {
            if totp.generate(step * TOTP_STEP_SECONDS) == code {
                return Ok(Some(step));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn engine() -> TotpEngine {
        TotpEngine::new("warden".to_string())
    }

    #[test]
    fn enrollment_material_is_complete() {
        let enrollment = engine().begin_enrollment("alice@example.com").unwrap();
        assert!(!enrollment.secret_base32.is_empty());
        assert!(enrollment.otpauth_url.starts_with("otpauth://totp/"));
        assert!(enrollment.otpauth_url.contains("issuer=warden"));
        assert!(enrollment.qr_data_url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn provision_round_trips_the_secret() {
        let engine = engine();
        let first = engine.begin_enrollment("alice@example.com").unwrap();
        let again = engine
            .provision(&first.secret_base32, "alice@example.com")
            .unwrap();
        assert_eq!(first.secret_base32, again.secret_base32);
        assert_eq!(first.otpauth_url, again.otpauth_url);
    }

    #[test]
    fn current_code_verifies_and_reports_its_step() {
        let engine = engine();
        let enrollment = engine.begin_enrollment("alice@example.com").unwrap();
        let now: u64 = 1_700_000_000;
        let step = now / TOTP_STEP_SECONDS;

        let totp = engine
            .build_from_base32(&enrollment.secret_base32, "account")
            .unwrap();
        let code = totp.generate(step * TOTP_STEP_SECONDS);

        let matched = engine
            .verify_at(&enrollment.secret_base32, &code, now)
            .unwrap();
        assert_eq!(matched, Some(step));
    }

    #[test]
    fn adjacent_step_codes_verify() {
        let engine = engine();
        let enrollment = engine.begin_enrollment("alice@example.com").unwrap();
        let now: u64 = 1_700_000_000;
        let step = now / TOTP_STEP_SECONDS;
        let totp = engine
            .build_from_base32(&enrollment.secret_base32, "account")
            .unwrap();

        let previous = totp.generate((step - 1) * TOTP_STEP_SECONDS);
        let next = totp.generate((step + 1) * TOTP_STEP_SECONDS);
        assert_eq!(
            engine
                .verify_at(&enrollment.secret_base32, &previous, now)
                .unwrap(),
            Some(step - 1)
        );
        assert_eq!(
            engine
                .verify_at(&enrollment.secret_base32, &next, now)
                .unwrap(),
            Some(step + 1)
        );
    }

    #[test]
    fn stale_code_is_rejected() {
        let engine = engine();
        let enrollment = engine.begin_enrollment("alice@example.com").unwrap();
        let now: u64 = 1_700_000_000;
        let step = now / TOTP_STEP_SECONDS;
        let totp = engine
            .build_from_base32(&enrollment.secret_base32, "account")
            .unwrap();

        let stale = totp.generate((step - 2) * TOTP_STEP_SECONDS);
        assert_eq!(
            engine
                .verify_at(&enrollment.secret_base32, &stale, now)
                .unwrap(),
            None
        );
    }

    #[test]
    fn malformed_codes_are_rejected_without_work() {
        let engine = engine();
        let enrollment = engine.begin_enrollment("alice@example.com").unwrap();
        let now: u64 = 1_700_000_000;
        for bad in ["", "12345", "1234567", "12345a", "abcdef"] {
            assert_eq!(
                engine
                    .verify_at(&enrollment.secret_base32, bad, now)
                    .unwrap(),
                None
            );
        }
    }

    #[test]
    fn undecodable_secret_is_an_error() {
        let engine = engine();
        assert!(engine.verify_at("not base32 !!!", "123456", 0).is_err());
    }
}
