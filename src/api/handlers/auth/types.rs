//! Request/response types for auth endpoints.
//!
//! Field names mirror what the browser client sends: signin/signup are JSON,
//! recovery and code verification are form-encoded, and response keys are
//! camelCase (`jwtToken`, `twoFactorRequired`, `is2faEnabled`).

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SigninRequest {
    pub username: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SigninResponse {
    pub jwt_token: String,
    pub two_factor_required: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ForgotPasswordForm {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordForm {
    pub token: String,
    pub new_password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyCodeForm {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VerifyLoginForm {
    pub code: String,
    pub jwt_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub jwt_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TwoFactorStatusResponse {
    #[serde(rename = "is2faEnabled")]
    pub is_2fa_enabled: bool,
    #[serde(rename = "qrCodeUrl")]
    pub qr_code_url: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentResponse {
    pub secret: String,
    pub otpauth_url: String,
    pub qr_code_url: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    #[serde(rename = "is2faEnabled")]
    pub is_2fa_enabled: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UpdateProfileRequest {
    pub username: Option<String>,
    pub email: Option<String>,
}
