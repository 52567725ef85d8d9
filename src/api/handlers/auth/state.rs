//! Auth state and configuration shared across handlers.

use secrecy::SecretString;
use std::sync::Arc;

use crate::token::{Denylist, TokenIssuer, DEFAULT_TOKEN_TTL_SECONDS};
use crate::totp::{SeenCodeCache, TotpEngine};

use super::rate_limit::RateLimiter;

const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 30 * 60;
const DEFAULT_TOTP_ISSUER: &str = "warden";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    token_ttl_seconds: i64,
    reset_token_ttl_seconds: i64,
    totp_issuer: String,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
        }
    }

    #[must_use]
    pub fn with_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: String) -> Self {
        self.totp_issuer = issuer;
        self
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn token_ttl_seconds(&self) -> i64 {
        self.token_ttl_seconds
    }

    pub(super) fn reset_token_ttl_seconds(&self) -> i64 {
        self.reset_token_ttl_seconds
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }
}

pub struct AuthState {
    config: AuthConfig,
    issuer: TokenIssuer,
    totp: TotpEngine,
    denylist: Denylist,
    seen_codes: SeenCodeCache,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl AuthState {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        signing_key: &SecretString,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        let issuer = TokenIssuer::new(signing_key, config.token_ttl_seconds());
        let totp = TotpEngine::new(config.totp_issuer().to_string());
        Self {
            config,
            issuer,
            totp,
            denylist: Denylist::new(),
            seen_codes: SeenCodeCache::new(),
            rate_limiter,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub(crate) fn totp(&self) -> &TotpEngine {
        &self.totp
    }

    pub(crate) fn denylist(&self) -> &Denylist {
        &self.denylist
    }

    pub(super) fn seen_codes(&self) -> &SeenCodeCache {
        &self.seen_codes
    }

    pub(super) fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }
}
