//! Auth endpoints: signin, signup, login-completion, and logout.
//!
//! Signin never reveals whether a username exists: unknown users burn a
//! dummy password verification and every credential failure returns the
//! same `401 Bad credentials`. A blocked account returns its status
//! message whether or not the password was right, so the response never
//! confirms the password; the Argon2 compare still runs to keep timing
//! uniform.

pub(crate) mod principal;
pub mod profile;
pub mod rate_limit;
pub mod recovery;
pub mod state;
mod storage;
pub mod twofa;
pub mod types;
mod utils;

pub use rate_limit::{NoopRateLimiter, RateLimiter, SlidingWindowRateLimiter};
pub use state::{AuthConfig, AuthState};

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, error};

use crate::password::{check_strength, hash_password, verify_dummy, verify_password};
use crate::token::FactorLevel;

use rate_limit::{RateLimitAction, RateLimitDecision};
use storage::{SignupOutcome, UserRecord};
use types::{
    MessageResponse, SigninRequest, SigninResponse, SignupRequest, TokenResponse, VerifyLoginForm,
};

const BAD_CREDENTIALS: &str = "Bad credentials";
const DEFAULT_ROLE: &str = "user";
// Self-service signup can only grant the baseline role.
const SIGNUP_ROLES: [&str; 1] = [DEFAULT_ROLE];

fn message_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(MessageResponse {
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn too_many_attempts() -> Response {
    message_response(
        StatusCode::TOO_MANY_REQUESTS,
        "Too many attempts, try again later",
    )
}

/// What a signin attempt resolves to once the user row is loaded and the
/// password has been compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginOutcome {
    /// Account is blocked; the message is returned for right and wrong
    /// passwords alike so it cannot confirm the password.
    Blocked(&'static str),
    BadCredentials,
    Authenticated {
        factor: FactorLevel,
        two_factor_required: bool,
    },
}

/// Decide the signin outcome. The status gate comes first: a blocked
/// account answers identically whatever the password verdict was.
fn login_outcome(user: &UserRecord, password_ok: bool) -> LoginOutcome {
    if let Some(message) = account_status_error(user) {
        return LoginOutcome::Blocked(message);
    }
    if !password_ok {
        return LoginOutcome::BadCredentials;
    }
    // Second factor enrolled: a PRIMARY token opens only the verify door.
    if user.twofa_enabled {
        LoginOutcome::Authenticated {
            factor: FactorLevel::Primary,
            two_factor_required: true,
        }
    } else {
        LoginOutcome::Authenticated {
            factor: FactorLevel::Verified,
            two_factor_required: false,
        }
    }
}

/// Whitelist the requested roles; an empty request gets the default.
fn signup_roles(requested: &[String]) -> Result<Vec<String>, &'static str> {
    if requested.is_empty() {
        return Ok(vec![DEFAULT_ROLE.to_string()]);
    }
    let mut roles: Vec<String> = Vec::with_capacity(requested.len());
    for role in requested {
        if !SIGNUP_ROLES.contains(&role.as_str()) {
            return Err("Unknown role");
        }
        if !roles.contains(role) {
            roles.push(role.clone());
        }
    }
    Ok(roles)
}

fn account_status_error(user: &UserRecord) -> Option<&'static str> {
    if !user.account_enabled {
        return Some("User account is disabled");
    }
    if user.account_locked {
        return Some("User account is locked");
    }
    if user.account_expired {
        return Some("User account has expired");
    }
    if user
        .credentials_expire_at
        .is_some_and(|at| at <= Utc::now())
    {
        return Some("User credentials have expired");
    }
    None
}

#[utoipa::path(
    post,
    path = "/api/auth/public/signin",
    request_body = SigninRequest,
    responses(
        (status = 200, description = "Token issued; twoFactorRequired signals the next step", body = SigninResponse),
        (status = 401, description = "Bad credentials or blocked account", body = MessageResponse),
        (status = 429, description = "Too many attempts", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn signin(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<SigninRequest>,
) -> Response {
    let ip = utils::extract_client_ip(&headers);
    let limiter_key = ip.unwrap_or_else(|| request.username.clone());
    if auth_state
        .rate_limiter()
        .check(&limiter_key, RateLimitAction::Signin)
        == RateLimitDecision::Limited
    {
        return too_many_attempts();
    }

    let username = utils::normalize_username(&request.username);
    let user = match storage::lookup_user_by_username(&pool, &username).await {
        Ok(user) => user,
        Err(err) => {
            error!("Failed to lookup user: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Some(user) = user else {
        // Burn equivalent work so latency does not confirm the account.
        verify_dummy(&request.password);
        auth_state
            .rate_limiter()
            .record_failure(&limiter_key, RateLimitAction::Signin);
        return message_response(StatusCode::UNAUTHORIZED, BAD_CREDENTIALS);
    };

    // The compare always runs, even for accounts the status gate will
    // block, so response timing stays uniform.
    let password_ok = match verify_password(&request.password, &user.password_hash) {
        Ok(ok) => ok,
        Err(err) => {
            error!("Failed to verify password: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match login_outcome(&user, password_ok) {
        LoginOutcome::Blocked(message) => {
            debug!(user_id = %user.id, "signin blocked: {message}");
            message_response(StatusCode::UNAUTHORIZED, message)
        }
        LoginOutcome::BadCredentials => {
            auth_state
                .rate_limiter()
                .record_failure(&limiter_key, RateLimitAction::Signin);
            message_response(StatusCode::UNAUTHORIZED, BAD_CREDENTIALS)
        }
        LoginOutcome::Authenticated {
            factor,
            two_factor_required,
        } => {
            auth_state
                .rate_limiter()
                .record_success(&limiter_key, RateLimitAction::Signin);

            match auth_state.issuer().issue(user.id, factor) {
                Ok(issued) => (
                    StatusCode::OK,
                    Json(SigninResponse {
                        jwt_token: issued.jwt,
                        two_factor_required,
                    }),
                )
                    .into_response(),
                Err(err) => {
                    error!("Failed to issue session token: {err}");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/public/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "User registered", body = MessageResponse),
        (status = 400, description = "Invalid email, weak password, or unknown role", body = MessageResponse),
        (status = 409, description = "Username or email already taken", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn signup(
    pool: Extension<PgPool>,
    Json(request): Json<SignupRequest>,
) -> Response {
    let username = utils::normalize_username(&request.username);
    if username.is_empty() {
        return message_response(StatusCode::BAD_REQUEST, "Username is required");
    }

    let email = utils::normalize_email(&request.email);
    if !utils::valid_email(&email) {
        return message_response(StatusCode::BAD_REQUEST, "Invalid email address");
    }

    if let Err(reason) = check_strength(&request.password) {
        return message_response(StatusCode::BAD_REQUEST, reason);
    }

    let roles = match signup_roles(&request.role) {
        Ok(roles) => roles,
        Err(reason) => return message_response(StatusCode::BAD_REQUEST, reason),
    };

    let password_hash = match hash_password(&request.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match storage::insert_user(&pool, &username, &email, &password_hash, &roles).await {
        Ok(SignupOutcome::Created) => {
            message_response(StatusCode::CREATED, "User registered successfully!")
        }
        Ok(SignupOutcome::Conflict) => {
            message_response(StatusCode::CONFLICT, "Username or email already taken")
        }
        Err(err) => {
            error!("Failed to insert user: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/public/verify-2fa-login",
    request_body(content = VerifyLoginForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Fresh fully-authenticated token", body = TokenResponse),
        (status = 401, description = "Invalid token or code", body = MessageResponse),
        (status = 429, description = "Too many attempts", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn verify_2fa_login(
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Form(form): Form<VerifyLoginForm>,
) -> Response {
    let token = match principal::authenticate_token(&form.jwt_token, &auth_state) {
        Ok(token) => token,
        Err(rejection) => return rejection.into_response(),
    };

    let limiter_key = token.subject.to_string();
    if auth_state
        .rate_limiter()
        .check(&limiter_key, RateLimitAction::SecondFactor)
        == RateLimitDecision::Limited
    {
        return too_many_attempts();
    }

    let user = match storage::lookup_user_by_id(&pool, token.subject).await {
        Ok(user) => user,
        Err(err) => {
            error!("Failed to lookup user: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let secret = user
        .filter(|user| user.twofa_enabled)
        .and_then(|user| user.twofa_secret);
    let Some(secret) = secret else {
        return message_response(StatusCode::UNAUTHORIZED, "Second factor is not enabled");
    };

    let now = Utc::now().timestamp();
    let now_unsigned = u64::try_from(now).unwrap_or(0);
    let matched = match auth_state.totp().verify_at(&secret, &form.code, now_unsigned) {
        Ok(matched) => matched,
        Err(err) => {
            error!("Failed to verify TOTP code: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // A replayed code fails exactly like a wrong one.
    let fresh = matched.is_some_and(|step| {
        auth_state
            .seen_codes()
            .check_and_record(token.subject, &form.code, step, now)
    });
    if !fresh {
        auth_state
            .rate_limiter()
            .record_failure(&limiter_key, RateLimitAction::SecondFactor);
        return message_response(StatusCode::UNAUTHORIZED, "Invalid verification code");
    }

    auth_state
        .rate_limiter()
        .record_success(&limiter_key, RateLimitAction::SecondFactor);

    // Issue a fresh fully-authenticated token; the step-up token is retired
    // so it cannot be presented again.
    match auth_state.issuer().issue(token.subject, FactorLevel::Verified) {
        Ok(issued) => {
            auth_state.denylist().revoke(token.jti, token.expires_at, now);
            (
                StatusCode::OK,
                Json(TokenResponse {
                    jwt_token: issued.jwt,
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!("Failed to issue session token: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses(
        (status = 204, description = "Token revoked for its remaining lifetime")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    // Idempotent: a missing or already-dead token still gets a 204.
    if let Ok(token) = principal::authenticate(&headers, &auth_state) {
        auth_state
            .denylist()
            .revoke(token.jti, token.expires_at, Utc::now().timestamp());
    }
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn active_user() -> UserRecord {
        UserRecord {
            id: uuid::Uuid::new_v4(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "$argon2id$stub".to_string(),
            roles: vec!["user".to_string()],
            account_enabled: true,
            account_locked: false,
            account_expired: false,
            credentials_expire_at: None,
            twofa_enabled: false,
            twofa_secret: None,
            twofa_pending_secret: None,
        }
    }

    #[test]
    fn active_account_passes_the_status_gate() {
        assert_eq!(account_status_error(&active_user()), None);
    }

    #[test]
    fn each_status_flag_blocks_signin() {
        let mut user = active_user();
        user.account_enabled = false;
        assert_eq!(account_status_error(&user), Some("User account is disabled"));

        let mut user = active_user();
        user.account_locked = true;
        assert_eq!(account_status_error(&user), Some("User account is locked"));

        let mut user = active_user();
        user.account_expired = true;
        assert_eq!(account_status_error(&user), Some("User account has expired"));
    }

    #[test]
    fn expired_credentials_block_signin() {
        let mut user = active_user();
        user.credentials_expire_at = Some(Utc::now() - Duration::hours(1));
        assert_eq!(
            account_status_error(&user),
            Some("User credentials have expired")
        );

        user.credentials_expire_at = Some(Utc::now() + Duration::hours(1));
        assert_eq!(account_status_error(&user), None);
    }

    #[test]
    fn blocked_account_answers_the_same_for_any_password() {
        let mut user = active_user();
        user.account_locked = true;

        // The status message must not confirm the password.
        let with_right_password = login_outcome(&user, true);
        let with_wrong_password = login_outcome(&user, false);
        assert_eq!(with_right_password, with_wrong_password);
        assert_eq!(
            with_right_password,
            LoginOutcome::Blocked("User account is locked")
        );
    }

    #[test]
    fn wrong_password_on_an_active_account_is_bad_credentials() {
        assert_eq!(
            login_outcome(&active_user(), false),
            LoginOutcome::BadCredentials
        );
    }

    #[test]
    fn factor_level_tracks_second_factor_enrollment() {
        assert_eq!(
            login_outcome(&active_user(), true),
            LoginOutcome::Authenticated {
                factor: FactorLevel::Verified,
                two_factor_required: false,
            }
        );

        let mut user = active_user();
        user.twofa_enabled = true;
        assert_eq!(
            login_outcome(&user, true),
            LoginOutcome::Authenticated {
                factor: FactorLevel::Primary,
                two_factor_required: true,
            }
        );
    }

    #[test]
    fn signup_roles_default_and_whitelist() {
        assert_eq!(signup_roles(&[]), Ok(vec!["user".to_string()]));
        assert_eq!(
            signup_roles(&["user".to_string(), "user".to_string()]),
            Ok(vec!["user".to_string()])
        );
        assert_eq!(signup_roles(&["admin".to_string()]), Err("Unknown role"));
        assert_eq!(
            signup_roles(&["user".to_string(), "root".to_string()]),
            Err("Unknown role")
        );
    }
}
