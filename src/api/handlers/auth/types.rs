//! Request/response types for auth endpoints.
//!
//! Handlers read bodies through `Payload` so that field errors can be
//! reported per field; these types describe the same shapes for `OpenAPI`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password1: String,
    pub password2: String,
    /// IANA timezone name, e.g. `Asia/Seoul`.
    pub tz: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ConfirmEmailRequest {
    pub key: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasswordResetConfirmRequest {
    pub new_password1: String,
    pub new_password2: String,
    pub uid: String,
    pub token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasswordChangeRequest {
    pub old_password: String,
    pub new_password1: String,
    pub new_password2: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DetailResponse {
    pub detail: String,
}

impl DetailResponse {
    pub fn new(detail: &str) -> Self {
        Self {
            detail: detail.to_string(),
        }
    }
}

/// API token on login, confirmation key on key lookup.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct KeyResponse {
    pub key: String,
}

/// Field name to messages; `non_field_errors` holds cross-field errors.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ValidationErrorResponse(pub BTreeMap<String, Vec<String>>);
