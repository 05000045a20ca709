//! E-mail confirmation endpoints.

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use super::{
    messages::confirmation_email,
    state::AuthState,
    types::{ConfirmEmailRequest, DetailResponse, EmailRequest, KeyResponse, ValidationErrorResponse},
    utils::{build_confirm_url, generate_confirmation_key, hash_secret, normalize_email},
    VERIFICATION_SENT,
};
use crate::api::{
    error::ApiError,
    handlers::forms::{CharField, FormReader, Payload},
};
use crate::store::{DynStore, NewConfirmation, ResendOutcome};

fn confirmation_cutoff(auth_state: &AuthState, now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(auth_state.config().confirmation_ttl_seconds())
}

fn valid_key_format(key: &str) -> bool {
    Regex::new(r"^[-:\w]+$").is_ok_and(|re| re.is_match(key))
}

/// Landing after registration.
#[utoipa::path(
    get,
    path = "/auth/confirm/",
    responses(
        (status = 200, description = "Verification e-mail was sent", body = DetailResponse)
    ),
    tag = "auth"
)]
pub async fn verification_sent() -> impl IntoResponse {
    Json(DetailResponse::new(VERIFICATION_SENT))
}

/// Look up a confirmation key from the e-mail link.
#[utoipa::path(
    get,
    path = "/auth/confirm/{key}/",
    params(
        ("key" = String, Path, description = "Confirmation key from the e-mail")
    ),
    responses(
        (status = 200, description = "Key identifies a pending confirmation", body = KeyResponse),
        (status = 404, description = "Unknown or expired key", body = DetailResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn confirmation_key(
    Path(key): Path<String>,
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, ApiError> {
    if !valid_key_format(&key) {
        return Err(ApiError::NotFound);
    }
    let not_before = confirmation_cutoff(&auth_state, Utc::now());
    if store.confirmation_exists(&hash_secret(&key), not_before).await? {
        Ok(Json(KeyResponse { key }))
    } else {
        Err(ApiError::NotFound)
    }
}

/// Verify the address behind `key` and consume the key.
#[utoipa::path(
    post,
    path = "/auth/confirm/",
    request_body = ConfirmEmailRequest,
    responses(
        (status = 200, description = "E-mail address verified", body = DetailResponse),
        (status = 400, description = "Missing key", body = ValidationErrorResponse),
        (status = 404, description = "Unknown or expired key", body = DetailResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn confirm_email(
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Payload,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = FormReader::new(&payload);
    let key = form.char("key", CharField::new());
    form.finish()?;
    let key = key.ok_or(ApiError::NotFound)?;

    let not_before = confirmation_cutoff(&auth_state, Utc::now());
    if store.confirm_email(&hash_secret(&key), not_before).await? {
        info!("email address confirmed");
        Ok(Json(DetailResponse::new("ok")))
    } else {
        Err(ApiError::NotFound)
    }
}

/// Queue a fresh confirmation e-mail. The response never reveals whether the
/// address is registered.
#[utoipa::path(
    post,
    path = "/auth/confirm/resend/",
    request_body = EmailRequest,
    responses(
        (status = 200, description = "Resend accepted", body = DetailResponse),
        (status = 400, description = "Invalid e-mail", body = ValidationErrorResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn resend_confirmation(
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Payload,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = FormReader::new(&payload);
    let email = form.email("email", CharField::new());
    form.finish()?;
    let Some(email) = email.map(|email| normalize_email(&email)) else {
        return Ok(Json(DetailResponse::new("ok")));
    };

    let config = auth_state.config();
    let key = generate_confirmation_key()?;
    let message = confirmation_email(config, &email, &build_confirm_url(config.site_url(), &key));
    let cooldown_since = Utc::now() - Duration::seconds(config.resend_cooldown_seconds());

    match store
        .queue_confirmation(
            &email,
            NewConfirmation {
                key_hash: hash_secret(&key),
                message,
            },
            cooldown_since,
        )
        .await
    {
        Ok(ResendOutcome::Queued) => info!("confirmation e-mail queued"),
        Ok(outcome @ (ResendOutcome::Cooldown | ResendOutcome::Noop)) => {
            debug!(?outcome, "confirmation resend skipped");
        }
        // Failures stay invisible to the caller.
        Err(err) => error!("Failed to queue confirmation resend: {err:#}"),
    }

    Ok(Json(DetailResponse::new("ok")))
}
