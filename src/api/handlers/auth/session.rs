//! Token authentication: header and cookie extraction, and the
//! [`AuthenticatedUser`] extractor for protected handlers.

use anyhow::anyhow;
use axum::{
    extract::FromRequestParts,
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, COOKIE},
        request::Parts,
        HeaderMap, HeaderValue,
    },
};
use chrono::Utc;
use std::sync::Arc;

use super::{state::AuthState, utils::hash_secret};
use crate::api::error::ApiError;
use crate::store::{DynStore, User};

pub const SESSION_COOKIE_NAME: &str = "innocent_session";

/// The user behind a valid token. Rejects with `401` otherwise.
#[derive(Debug)]
pub struct AuthenticatedUser {
    pub user: User,
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let store = parts
            .extensions
            .get::<DynStore>()
            .cloned()
            .ok_or_else(|| anyhow!("store not found in request extensions"))?;

        let token = extract_token(&parts.headers).ok_or(ApiError::NotAuthenticated)?;
        match store.user_by_token(&hash_secret(&token), Utc::now()).await? {
            Some(user) => Ok(Self { user }),
            None => Err(ApiError::InvalidToken),
        }
    }
}

/// Token from `Authorization: Token|Bearer <key>`, falling back to the
/// session cookie.
pub(super) fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_authorization_token(headers) {
        return Some(token);
    }
    extract_cookie_token(headers)
}

fn extract_authorization_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("token") && !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn extract_cookie_token(headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let Some((key, val)) = pair.trim().split_once('=') else {
                continue;
            };
            if key.trim() == SESSION_COOKIE_NAME && !val.trim().is_empty() {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

/// `HttpOnly` cookie carrying the API token. `Secure` only over HTTPS.
pub(super) fn session_cookie(
    auth_state: &Arc<AuthState>,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = auth_state.config().token_ttl_seconds();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if auth_state.config().session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn clear_session_cookie(
    auth_state: &Arc<AuthState>,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if auth_state.config().session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn token_and_bearer_schemes_are_accepted() {
        assert_eq!(
            extract_token(&headers(&[("authorization", "Token abc123")])),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_token(&headers(&[("authorization", "bearer abc123")])),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_token(&headers(&[("authorization", "Basic dXNlcjpwYXNz")])),
            None
        );
        assert_eq!(extract_token(&headers(&[("authorization", "Token ")])), None);
    }

    #[test]
    fn cookie_is_a_fallback() {
        let map = headers(&[("cookie", "theme=dark; innocent_session=fromcookie")]);
        assert_eq!(extract_token(&map), Some("fromcookie".to_string()));

        let map = headers(&[
            ("authorization", "Token fromheader"),
            ("cookie", "innocent_session=fromcookie"),
        ]);
        assert_eq!(extract_token(&map), Some("fromheader".to_string()));

        let map = headers(&[("cookie", "innocent_session=")]);
        assert_eq!(extract_token(&map), None);
    }
}
