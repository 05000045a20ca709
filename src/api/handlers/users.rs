//! Current-user endpoints.

use axum::{extract::Extension, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;

use super::{
    auth::{register::NAME_MAX_LENGTH, types::ValidationErrorResponse, AuthenticatedUser},
    forms::{CharField, FormReader, Payload},
};
use crate::api::error::ApiError;
use crate::store::{DynStore, User};

#[derive(Debug, Serialize, ToSchema)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: String,
    pub tz: String,
    pub email_verified: bool,
    pub date_joined: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id.to_string(),
            email: user.email,
            name: user.name,
            tz: user.tz,
            email_verified: user.email_verified,
            date_joined: user.date_joined,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UserUpdateRequest {
    pub name: Option<String>,
    pub tz: Option<String>,
}

#[utoipa::path(
    get,
    path = "/users/me/",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Not authenticated")
    ),
    security(
        ("token" = [])
    ),
    tag = "users"
)]
pub async fn me(authenticated: AuthenticatedUser) -> impl IntoResponse {
    Json(UserResponse::from(authenticated.user))
}

#[utoipa::path(
    patch,
    path = "/users/me/",
    request_body = UserUpdateRequest,
    responses(
        (status = 200, description = "Updated user", body = UserResponse),
        (status = 400, description = "Invalid input", body = ValidationErrorResponse),
        (status = 401, description = "Not authenticated")
    ),
    security(
        ("token" = [])
    ),
    tag = "users"
)]
#[instrument(skip_all)]
pub async fn update_me(
    authenticated: AuthenticatedUser,
    store: Extension<DynStore>,
    payload: Payload,
) -> Result<impl IntoResponse, ApiError> {
    let mut user = authenticated.user;
    let mut form = FormReader::new(&payload);
    let name = form.char("name", CharField::new().optional().max_length(NAME_MAX_LENGTH));
    let tz = form.timezone("tz", CharField::new().optional());
    form.finish()?;

    if name.is_none() && tz.is_none() {
        return Ok(Json(UserResponse::from(user)));
    }
    if let Some(name) = name {
        user.name = name;
    }
    if let Some(tz) = tz {
        user.tz = tz;
    }
    store.update_profile(user.id, &user.name, &user.tz).await?;
    info!(user_id = %user.id, "profile updated");

    Ok(Json(UserResponse::from(user)))
}
