//! Token login and logout.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap},
    response::IntoResponse,
    Json,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, instrument};

use super::{
    session::{clear_session_cookie, extract_token, session_cookie},
    state::AuthState,
    types::{DetailResponse, KeyResponse, LoginRequest, ValidationErrorResponse},
    utils::{generate_api_token, hash_secret, normalize_email},
};
use crate::api::{
    error::ApiError,
    handlers::forms::{CharField, FormReader, Payload},
};
use crate::store::DynStore;

const INVALID_CREDENTIALS: &str = "Unable to log in with provided credentials.";
const EMAIL_NOT_VERIFIED: &str = "E-mail is not verified.";
const MISSING_CREDENTIALS: &str = "Must include \"email\" and \"password\".";

/// Exchange e-mail and password for an API token.
#[utoipa::path(
    post,
    path = "/auth/login/",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token issued, session cookie set", body = KeyResponse),
        (status = 400, description = "Invalid credentials", body = ValidationErrorResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Payload,
) -> Result<impl IntoResponse, ApiError> {
    let mut form = FormReader::new(&payload);
    let email = form.email("email", CharField::new().optional().allow_blank());
    let password = form.password("password");
    form.finish()?;

    let (Some(email), Some(password)) = (email.filter(|email| !email.is_empty()), password)
    else {
        return Err(ApiError::non_field(MISSING_CREDENTIALS));
    };
    let email = normalize_email(&email);

    let user = store.user_by_email(&email).await?;
    let stored_hash = user.as_ref().map(|user| user.password_hash.clone());
    let password_ok = auth_state.0.verify_password(password, stored_hash).await?;
    let user = match user {
        Some(user) if password_ok => user,
        _ => return Err(ApiError::non_field(INVALID_CREDENTIALS)),
    };
    if !user.email_verified {
        return Err(ApiError::non_field(EMAIL_NOT_VERIFIED));
    }

    let now = Utc::now();
    let token = generate_api_token()?;
    let expires_at = now + Duration::seconds(auth_state.config().token_ttl_seconds());
    store
        .insert_token(user.id, &hash_secret(&token), expires_at)
        .await?;
    store.record_login(user.id, now).await?;
    info!(user_id = %user.id, "user logged in");

    let mut headers = HeaderMap::new();
    match session_cookie(&auth_state, &token) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    Ok((headers, Json(KeyResponse { key: token })))
}

/// Revoke the presented token, if any, and clear the session cookie.
#[utoipa::path(
    post,
    path = "/auth/logout/",
    responses(
        (status = 200, description = "Logged out", body = DetailResponse)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn logout(
    headers: HeaderMap,
    store: Extension<DynStore>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    if let Some(token) = extract_token(&headers) {
        if let Err(err) = store.delete_token(&hash_secret(&token)).await {
            error!("Failed to delete token: {err:#}");
        }
    }

    // Always clear the cookie, even if the token was unknown.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(&auth_state) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        response_headers,
        Json(DetailResponse::new("Successfully logged out.")),
    )
}
