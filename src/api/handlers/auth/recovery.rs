//! Password recovery: request a reset link, redeem it once.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::password::{check_strength, hash_password};

use super::rate_limit::{RateLimitAction, RateLimitDecision};
use super::state::AuthState;
use super::storage::{self, ResetOutcome};
use super::types::{ForgotPasswordForm, MessageResponse, ResetPasswordForm};
use super::utils;

const RESET_REQUESTED: &str = "If the email exists, a reset link has been sent";

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
    path = "/api/auth/public/forgot-password",
    request_body(content = ForgotPasswordForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Uniform response whether or not the account exists", body = MessageResponse),
        (status = 429, description = "Too many attempts", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn forgot_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Form(form): Form<ForgotPasswordForm>,
) -> Response {
    let email = utils::normalize_email(&form.email);
    let limiter_key = utils::extract_client_ip(&headers).unwrap_or_else(|| email.clone());
    if auth_state
        .rate_limiter()
        .check(&limiter_key, RateLimitAction::Recovery)
        == RateLimitDecision::Limited
    {
        return message_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many attempts, try again later",
        );
    }

    // Invalid addresses get the uniform answer too; only well-formed ones
    // reach the store.
    if utils::valid_email(&email) {
        if let Err(err) = storage::request_password_reset(&pool, &email, auth_state.config()).await
        {
            error!("Failed to create recovery token: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    message_response(StatusCode::OK, RESET_REQUESTED)
}

#[utoipa::path(
    post,
    path = "/api/auth/public/reset-password",
    request_body(content = ResetPasswordForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Password updated; token consumed", body = MessageResponse),
        (status = 400, description = "Unknown token or weak password", body = MessageResponse),
        (status = 410, description = "Token already consumed or expired", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn reset_password(
    pool: Extension<PgPool>,
    Form(form): Form<ResetPasswordForm>,
) -> Response {
    if let Err(reason) = check_strength(&form.new_password) {
        return message_response(StatusCode::BAD_REQUEST, reason);
    }

    let new_password_hash = match hash_password(&form.new_password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let token_hash = utils::hash_recovery_token(form.token.trim());
    match storage::consume_reset_token(&pool, &token_hash, &new_password_hash).await {
        Ok(ResetOutcome::Done) => {
            message_response(StatusCode::OK, "Password has been reset successfully")
        }
        Ok(ResetOutcome::AlreadyConsumed) => {
            message_response(StatusCode::GONE, "Reset token has already been used")
        }
        Ok(ResetOutcome::Expired) => {
            message_response(StatusCode::GONE, "Reset token has expired")
        }
        Ok(ResetOutcome::Unknown) => {
            message_response(StatusCode::BAD_REQUEST, "Invalid reset token")
        }
        Err(err) => {
            error!("Failed to consume recovery token: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
