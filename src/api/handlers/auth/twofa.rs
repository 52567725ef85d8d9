//! Second-factor lifecycle endpoints: enroll, confirm, disable, status.
//!
//! Enrollment is two-phase. `enable-2fa` parks a candidate secret and hands
//! back the provisioning material; codes only start being required at signin
//! once `verify-2fa` proves the authenticator actually holds the secret.
//! The QR is shown only while enrollment is pending; an active secret is
//! never re-displayed.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::principal;
use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::state::AuthState;
use super::storage;
use super::types::{
    EnrollmentResponse, MessageResponse, TwoFactorStatusResponse, VerifyCodeForm,
};

fn message_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(MessageResponse {
            message: message.to_string(),
        }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/api/auth/enable-2fa",
    responses(
        (status = 200, description = "Enrollment started; scan and confirm with verify-2fa", body = EnrollmentResponse),
        (status = 401, description = "Unauthorized", body = MessageResponse)
    ),
    tag = "2fa",
    security(("bearer" = []))
)]
pub async fn enable_2fa(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    let token = match principal::authenticate(&headers, &auth_state) {
        Ok(token) => token,
        Err(rejection) => return rejection.into_response(),
    };
    if let Err(rejection) = principal::require_verified(&token) {
        return rejection.into_response();
    }

    let user = match storage::lookup_user_by_id(&pool, token.subject).await {
        Ok(Some(user)) => user,
        Ok(None) => return message_response(StatusCode::UNAUTHORIZED, "Unauthorized"),
        Err(err) => {
            error!("Failed to lookup user: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let enrollment = match auth_state.totp().begin_enrollment(&user.email) {
        Ok(enrollment) => enrollment,
        Err(err) => {
            error!("Failed to generate enrollment material: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Re-running enrollment replaces the previous pending secret; an active
    // secret stays untouched until the new one is confirmed.
    if let Err(err) =
        storage::store_pending_secret(&pool, user.id, &enrollment.secret_base32).await
    {
        error!("Failed to store pending secret: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        Json(EnrollmentResponse {
            secret: enrollment.secret_base32,
            otpauth_url: enrollment.otpauth_url,
            qr_code_url: enrollment.qr_data_url,
        }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/api/auth/verify-2fa",
    request_body(content = VerifyCodeForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Enrollment confirmed; codes now required at signin", body = MessageResponse),
        (status = 401, description = "Invalid code or no pending enrollment", body = MessageResponse),
        (status = 429, description = "Too many attempts", body = MessageResponse)
    ),
    tag = "2fa",
    security(("bearer" = []))
)]
pub async fn verify_2fa(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Form(form): Form<VerifyCodeForm>,
) -> Response {
    // PRIMARY tokens are accepted here: confirming possession of the second
    // factor is exactly what a step-up session is for.
    let token = match principal::authenticate(&headers, &auth_state) {
        Ok(token) => token,
        Err(rejection) => return rejection.into_response(),
    };

    let limiter_key = token.subject.to_string();
    if auth_state
        .rate_limiter()
        .check(&limiter_key, RateLimitAction::SecondFactor)
        == RateLimitDecision::Limited
    {
        return message_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many attempts, try again later",
        );
    }

    let user = match storage::lookup_user_by_id(&pool, token.subject).await {
        Ok(Some(user)) => user,
        Ok(None) => return message_response(StatusCode::UNAUTHORIZED, "Unauthorized"),
        Err(err) => {
            error!("Failed to lookup user: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let Some(pending_secret) = user.twofa_pending_secret else {
        return message_response(StatusCode::UNAUTHORIZED, "No pending enrollment");
    };

    let now = Utc::now().timestamp();
    let now_unsigned = u64::try_from(now).unwrap_or(0);
    let matched = match auth_state
        .totp()
        .verify_at(&pending_secret, &form.code, now_unsigned)
    {
        Ok(matched) => matched,
        Err(err) => {
            error!("Failed to verify TOTP code: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
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

    match storage::confirm_pending_secret(&pool, user.id).await {
        Ok(true) => {
            auth_state
                .rate_limiter()
                .record_success(&limiter_key, RateLimitAction::SecondFactor);
            message_response(StatusCode::OK, "Two-factor authentication enabled")
        }
        // The pending secret vanished between lookup and confirm.
        Ok(false) => message_response(StatusCode::UNAUTHORIZED, "No pending enrollment"),
        Err(err) => {
            error!("Failed to confirm enrollment: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/auth/disable-2fa",
    responses(
        (status = 200, description = "Second factor disabled and secret discarded", body = MessageResponse),
        (status = 401, description = "Unauthorized", body = MessageResponse)
    ),
    tag = "2fa",
    security(("bearer" = []))
)]
pub async fn disable_2fa(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    let token = match principal::authenticate(&headers, &auth_state) {
        Ok(token) => token,
        Err(rejection) => return rejection.into_response(),
    };
    if let Err(rejection) = principal::require_verified(&token) {
        return rejection.into_response();
    }

    match storage::disable_twofa(&pool, token.subject).await {
        Ok(()) => message_response(StatusCode::OK, "Two-factor authentication disabled"),
        Err(err) => {
            error!("Failed to disable second factor: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/auth/user/2fa-status",
    responses(
        (status = 200, description = "Enrollment state; QR only while an enrollment is pending", body = TwoFactorStatusResponse),
        (status = 401, description = "Unauthorized", body = MessageResponse)
    ),
    tag = "2fa",
    security(("bearer" = []))
)]
pub async fn twofa_status(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    let token = match principal::authenticate(&headers, &auth_state) {
        Ok(token) => token,
        Err(rejection) => return rejection.into_response(),
    };
    if let Err(rejection) = principal::require_verified(&token) {
        return rejection.into_response();
    }

    let user = match storage::lookup_user_by_id(&pool, token.subject).await {
        Ok(Some(user)) => user,
        Ok(None) => return message_response(StatusCode::UNAUTHORIZED, "Unauthorized"),
        Err(err) => {
            error!("Failed to lookup user: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let qr_code_url = match user.twofa_pending_secret.as_deref() {
        Some(pending) => match auth_state.totp().provision(pending, &user.email) {
            Ok(enrollment) => Some(enrollment.qr_data_url),
            Err(err) => {
                error!("Failed to rebuild provisioning material: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        },
        None => None,
    };

    (
        StatusCode::OK,
        Json(TwoFactorStatusResponse {
            is_2fa_enabled: user.twofa_enabled,
            qr_code_url,
        }),
    )
        .into_response()
}
