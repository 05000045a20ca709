//! Account registration.

use anyhow::anyhow;
use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;
use tracing::{info, instrument};

use super::{
    messages::confirmation_email,
    state::AuthState,
    types::{DetailResponse, RegisterRequest, ValidationErrorResponse},
    utils::{build_confirm_url, generate_confirmation_key, hash_secret, normalize_email},
    PASSWORD_MISMATCH, VERIFICATION_SENT,
};
use crate::api::{
    error::ApiError,
    handlers::forms::{CharField, FormReader, Payload},
};
use crate::store::{CreateUserOutcome, DynStore, NewConfirmation, NewUser};

pub(crate) const NAME_MAX_LENGTH: usize = 25;
const EMAIL_TAKEN: &str = "A user is already registered with this e-mail address.";

/// Create an account and queue its verification e-mail.
#[utoipa::path(
    post,
    path = "/auth/register/",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created, verification e-mail queued", body = DetailResponse),
        (status = 400, description = "Invalid input", body = ValidationErrorResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn register(
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Payload,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = FormReader::new(&payload);
    let name = form.char("name", CharField::new().max_length(NAME_MAX_LENGTH));
    let email = form
        .email("email", CharField::new())
        .map(|email| normalize_email(&email));
    let password1 = form.password("password1");
    let password2 = form.password("password2");
    let tz = form.timezone("tz", CharField::new());

    if let Some(email) = &email {
        if store.email_address_exists(email).await? {
            form.add_error("email", EMAIL_TAKEN);
        }
    }

    // No account exists yet, so there are no attributes to compare against.
    if let Some(password1) = &password1 {
        for message in auth_state.policy().validate(password1, &[]) {
            form.add_error("password1", message);
        }
    }

    // Cross-field checks only run once every field is valid.
    if !form.has_errors() && password1 != password2 {
        form.add_non_field_error(PASSWORD_MISMATCH);
    }
    form.finish()?;

    let (Some(name), Some(email), Some(password), Some(tz)) = (name, email, password1, tz) else {
        return Err(anyhow!("registration form passed validation with missing fields").into());
    };

    let password_hash = auth_state.0.hash_password(password).await?;
    let config = auth_state.config();
    let key = generate_confirmation_key()?;
    let message = confirmation_email(config, &email, &build_confirm_url(config.site_url(), &key));

    let outcome = store
        .create_user(
            NewUser {
                email,
                name,
                tz,
                password_hash,
                email_verified: false,
            },
            Some(NewConfirmation {
                key_hash: hash_secret(&key),
                message,
            }),
        )
        .await?;

    match outcome {
        CreateUserOutcome::Created(user) => {
            info!(user_id = %user.id, "user registered");
            Ok((
                StatusCode::CREATED,
                Json(DetailResponse::new(VERIFICATION_SENT)),
            ))
        }
        // Lost a race with a concurrent registration for the same address.
        CreateUserOutcome::EmailTaken => Err(ApiError::field("email", EMAIL_TAKEN)),
    }
}
