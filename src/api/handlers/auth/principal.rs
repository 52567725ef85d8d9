//! Bearer-token authentication for protected routes.

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use tracing::debug;

use crate::token::{FactorLevel, TokenError, ValidatedToken};

use super::state::AuthState;
use super::types::MessageResponse;

/// Why a request could not be authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthRejection {
    MissingToken,
    Invalid(TokenError),
    /// Valid token, wrong factor level for the route.
    InsufficientFactor,
}

impl AuthRejection {
    /// Uniform 401 body; the distinguishing detail goes to the log only.
    pub(crate) fn into_response(self) -> Response {
        debug!("authentication rejected: {self:?}");
        (
            StatusCode::UNAUTHORIZED,
            Json(MessageResponse {
                message: "Unauthorized".to_string(),
            }),
        )
            .into_response()
    }
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Validate the bearer token on the request, checking the denylist.
pub(crate) fn authenticate(
    headers: &HeaderMap,
    auth_state: &AuthState,
) -> Result<ValidatedToken, AuthRejection> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(AuthRejection::MissingToken);
    };
    authenticate_token(&token, auth_state)
}

/// Validate a raw token string, checking the denylist.
pub(crate) fn authenticate_token(
    token: &str,
    auth_state: &AuthState,
) -> Result<ValidatedToken, AuthRejection> {
    let validated = auth_state
        .issuer()
        .validate(token)
        .map_err(AuthRejection::Invalid)?;
    if auth_state
        .denylist()
        .contains(validated.jti, Utc::now().timestamp())
    {
        return Err(AuthRejection::Invalid(TokenError::Revoked));
    }
    Ok(validated)
}

/// Routes behind the second factor require a VERIFIED token; a PRIMARY
/// token opens only the code-verification door.
pub(crate) fn require_verified(token: &ValidatedToken) -> Result<(), AuthRejection> {
    match token.factor {
        FactorLevel::Verified => Ok(()),
        FactorLevel::Primary => Err(AuthRejection::InsufficientFactor),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::rate_limit::NoopRateLimiter;
    use super::super::state::AuthConfig;
    use super::*;
    use axum::http::HeaderValue;
    use secrecy::SecretString;
    use std::sync::Arc;
    use uuid::Uuid;

    fn auth_state() -> AuthState {
        AuthState::new(
            AuthConfig::new("https://warden.dev".to_string()),
            &SecretString::from("test-signing-key"),
            Arc::new(NoopRateLimiter),
        )
    }

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn extract_bearer_token_handles_casing_and_whitespace() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  abc "));
        assert_eq!(extract_bearer_token(&headers), Some("abc".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn authenticate_round_trips_a_valid_token() {
        let state = auth_state();
        let subject = Uuid::new_v4();
        let issued = state
            .issuer()
            .issue(subject, FactorLevel::Verified)
            .unwrap();

        let validated = authenticate(&bearer_headers(&issued.jwt), &state).unwrap();
        assert_eq!(validated.subject, subject);
        assert!(require_verified(&validated).is_ok());
    }

    #[test]
    fn missing_token_is_rejected() {
        let state = auth_state();
        assert_eq!(
            authenticate(&HeaderMap::new(), &state),
            Err(AuthRejection::MissingToken)
        );
    }

    #[test]
    fn primary_token_fails_the_verified_gate() {
        let state = auth_state();
        let issued = state
            .issuer()
            .issue(Uuid::new_v4(), FactorLevel::Primary)
            .unwrap();
        let validated = authenticate_token(&issued.jwt, &state).unwrap();
        assert_eq!(
            require_verified(&validated),
            Err(AuthRejection::InsufficientFactor)
        );
    }

    #[test]
    fn denylisted_token_is_rejected() {
        let state = auth_state();
        let issued = state
            .issuer()
            .issue(Uuid::new_v4(), FactorLevel::Verified)
            .unwrap();
        state.denylist().revoke(
            issued.jti,
            issued.expires_at,
            Utc::now().timestamp(),
        );
        assert_eq!(
            authenticate_token(&issued.jwt, &state),
            Err(AuthRejection::Invalid(TokenError::Revoked))
        );
    }
}
