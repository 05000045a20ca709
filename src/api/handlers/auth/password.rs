//! Password reset by e-mail and password change.

use anyhow::anyhow;
use axum::{extract::Extension, response::IntoResponse, Json};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument};

use super::{
    messages::password_reset_email,
    reset_token::{decode_uid, encode_uid},
    session::AuthenticatedUser,
    state::AuthState,
    types::{
        DetailResponse, EmailRequest, PasswordChangeRequest, PasswordResetConfirmRequest,
        ValidationErrorResponse,
    },
    utils::{build_password_reset_url, normalize_email},
    PASSWORD_MISMATCH,
};
use crate::api::{
    error::ApiError,
    handlers::forms::{CharField, FormReader, Payload},
};
use crate::store::{DynStore, User};

const INVALID_VALUE: &str = "Invalid value";
const OLD_PASSWORD_INCORRECT: &str =
    "Your old password was entered incorrectly. Please enter it again.";

fn user_attributes(user: &User) -> [(&'static str, &str); 2] {
    [("email address", &user.email), ("name", &user.name)]
}

/// Mismatch and policy checks for a new password pair, reported on
/// `new_password2`.
fn check_new_password(
    form: &mut FormReader<'_>,
    auth_state: &AuthState,
    user: &User,
    new_password1: &str,
    new_password2: &str,
) {
    if new_password1 != new_password2 {
        form.add_error("new_password2", PASSWORD_MISMATCH);
        return;
    }
    for message in auth_state
        .policy()
        .validate(new_password2, &user_attributes(user))
    {
        form.add_error("new_password2", message);
    }
}

/// Send a reset link to the account with this e-mail, if it exists.
#[utoipa::path(
    post,
    path = "/auth/password/reset/",
    request_body = EmailRequest,
    responses(
        (status = 200, description = "Reset e-mail sent when the account exists", body = DetailResponse),
        (status = 400, description = "Invalid e-mail", body = ValidationErrorResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn password_reset(
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Payload,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = FormReader::new(&payload);
    let email = form.email("email", CharField::new());
    form.finish()?;

    if let Some(email) = email.map(|email| normalize_email(&email)) {
        if let Err(err) = send_reset_email(&store, &auth_state, &email).await {
            // Same answer either way so the endpoint does not reveal accounts.
            error!("Failed to queue password reset e-mail: {err:#}");
        }
    }

    Ok(Json(DetailResponse::new(
        "Password reset e-mail has been sent.",
    )))
}

async fn send_reset_email(
    store: &DynStore,
    auth_state: &AuthState,
    email: &str,
) -> anyhow::Result<()> {
    let Some(user) = store.user_by_email(email).await? else {
        return Ok(());
    };

    let config = auth_state.config();
    let token = auth_state.reset_tokens().make(&user, Utc::now())?;
    let url = build_password_reset_url(config.site_url(), &encode_uid(user.id), &token);
    store
        .enqueue_email(password_reset_email(config, &user.email, &url))
        .await?;
    info!(user_id = %user.id, "password reset e-mail queued");
    Ok(())
}

/// Set a new password with the uid and token from the reset link.
#[utoipa::path(
    post,
    path = "/auth/password/reset/confirm/",
    request_body = PasswordResetConfirmRequest,
    responses(
        (status = 200, description = "Password reset", body = DetailResponse),
        (status = 400, description = "Invalid input, uid, or token", body = ValidationErrorResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn password_reset_confirm(
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Payload,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = FormReader::new(&payload);
    let new_password1 = form.password("new_password1");
    let new_password2 = form.password("new_password2");
    let uid = form.char("uid", CharField::new());
    let token = form.char("token", CharField::new());
    form.finish()?;

    let (Some(new_password1), Some(new_password2), Some(uid), Some(token)) =
        (new_password1, new_password2, uid, token)
    else {
        return Err(anyhow!("reset form passed validation with missing fields").into());
    };

    let user = match decode_uid(&uid) {
        Some(id) => store.user_by_id(id).await?,
        None => None,
    };
    let Some(user) = user else {
        return Err(ApiError::field("uid", INVALID_VALUE));
    };

    let mut form = FormReader::new(&payload);
    check_new_password(&mut form, &auth_state, &user, &new_password1, &new_password2);
    form.finish()?;

    if !auth_state.reset_tokens().check(&user, &token, Utc::now()) {
        return Err(ApiError::field("token", INVALID_VALUE));
    }

    let password_hash = auth_state.0.hash_password(new_password2).await?;
    store.set_password(user.id, &password_hash).await?;
    let revoked = store.delete_user_tokens(user.id).await?;
    info!(user_id = %user.id, revoked, "password reset");

    Ok(Json(DetailResponse::new(
        "Password has been reset with the new password.",
    )))
}

/// Change the password of the authenticated user.
#[utoipa::path(
    post,
    path = "/auth/password/change/",
    request_body = PasswordChangeRequest,
    responses(
        (status = 200, description = "Password changed", body = DetailResponse),
        (status = 400, description = "Invalid input", body = ValidationErrorResponse),
        (status = 401, description = "Not authenticated", body = DetailResponse)
    ),
    security(
        ("token" = [])
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn password_change(
    authenticated: AuthenticatedUser,
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Payload,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticated.user;
    let mut form = FormReader::new(&payload);
    let old_password = form.password("old_password");
    let new_password1 = form.password("new_password1");
    let new_password2 = form.password("new_password2");

    if let Some(old_password) = old_password {
        let matches = auth_state
            .0
            .verify_password(old_password, Some(user.password_hash.clone()))
            .await?;
        if !matches {
            form.add_error("old_password", OLD_PASSWORD_INCORRECT);
        }
    }
    if let (Some(new_password1), Some(new_password2)) = (&new_password1, &new_password2) {
        check_new_password(&mut form, &auth_state, &user, new_password1, new_password2);
    }
    form.finish()?;

    let Some(new_password) = new_password2 else {
        return Err(anyhow!("password change form passed validation without a password").into());
    };
    let password_hash = auth_state.0.hash_password(new_password).await?;
    store.set_password(user.id, &password_hash).await?;
    info!(user_id = %user.id, "password changed");

    Ok(Json(DetailResponse::new("New password has been saved.")))
}
