//! Principal profile endpoints.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::principal;
use super::state::AuthState;
use super::storage::{self, ProfileOutcome, UserRecord};
use super::types::{MessageResponse, ProfileResponse, UpdateProfileRequest};
use super::utils;

fn message_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(MessageResponse {
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn profile_response(user: UserRecord) -> ProfileResponse {
    ProfileResponse {
        id: user.id.to_string(),
        username: user.username,
        email: user.email,
        roles: user.roles,
        is_2fa_enabled: user.twofa_enabled,
    }
}

async fn load_authenticated_user(
    headers: &HeaderMap,
    pool: &PgPool,
    auth_state: &AuthState,
) -> Result<UserRecord, Response> {
    let token = principal::authenticate(headers, auth_state)
        .map_err(principal::AuthRejection::into_response)?;
    principal::require_verified(&token).map_err(principal::AuthRejection::into_response)?;

    match storage::lookup_user_by_id(pool, token.subject).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(message_response(StatusCode::UNAUTHORIZED, "Unauthorized")),
        Err(err) => {
            error!("Failed to lookup user: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/auth/user",
    responses(
        (status = 200, description = "Profile for the authenticated principal", body = ProfileResponse),
        (status = 401, description = "Unauthorized", body = MessageResponse)
    ),
    tag = "user",
    security(("bearer" = []))
)]
pub async fn get_profile(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    match load_authenticated_user(&headers, &pool, &auth_state).await {
        Ok(user) => (StatusCode::OK, Json(profile_response(user))).into_response(),
        Err(response) => response,
    }
}

#[utoipa::path(
    get,
    path = "/api/auth/username",
    responses(
        (status = 200, description = "Bare username as plain text", body = String),
        (status = 401, description = "Unauthorized", body = MessageResponse)
    ),
    tag = "user",
    security(("bearer" = []))
)]
pub async fn get_username(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> Response {
    match load_authenticated_user(&headers, &pool, &auth_state).await {
        Ok(user) => (StatusCode::OK, user.username).into_response(),
        Err(response) => response,
    }
}

#[utoipa::path(
    put,
    path = "/api/auth/user",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Updated profile", body = ProfileResponse),
        (status = 400, description = "Invalid field value", body = MessageResponse),
        (status = 401, description = "Unauthorized", body = MessageResponse),
        (status = 409, description = "Username or email already taken", body = MessageResponse)
    ),
    tag = "user",
    security(("bearer" = []))
)]
pub async fn update_profile(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<UpdateProfileRequest>,
) -> Response {
    let user = match load_authenticated_user(&headers, &pool, &auth_state).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let username = request.username.as_deref().map(utils::normalize_username);
    if username.as_deref().is_some_and(str::is_empty) {
        return message_response(StatusCode::BAD_REQUEST, "Username must not be empty");
    }
    let email = request.email.as_deref().map(utils::normalize_email);
    if email.as_deref().is_some_and(|email| !utils::valid_email(email)) {
        return message_response(StatusCode::BAD_REQUEST, "Invalid email address");
    }

    match storage::update_profile(&pool, user.id, username.as_deref(), email.as_deref()).await {
        Ok(ProfileOutcome::Updated) => match storage::lookup_user_by_id(&pool, user.id).await {
            Ok(Some(updated)) => (StatusCode::OK, Json(profile_response(updated))).into_response(),
            Ok(None) => message_response(StatusCode::UNAUTHORIZED, "Unauthorized"),
            Err(err) => {
                error!("Failed to reload profile: {err}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Ok(ProfileOutcome::Conflict) => {
            message_response(StatusCode::CONFLICT, "Username or email already taken")
        }
        Ok(ProfileOutcome::NotFound) => message_response(StatusCode::UNAUTHORIZED, "Unauthorized"),
        Err(err) => {
            error!("Failed to update profile: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
