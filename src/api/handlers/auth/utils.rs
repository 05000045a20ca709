//! Small helpers for key generation and hashing.

use anyhow::{Context, Result};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Create a new e-mail confirmation key.
///
/// The key is only sent to the user; the store keeps its hash.
pub(super) fn generate_confirmation_key() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate confirmation key")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Create a new API token: 40 lowercase hex characters.
pub(crate) fn generate_api_token() -> Result<String> {
    let mut bytes = [0u8; 20];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate api token")?;
    Ok(hex::encode(bytes))
}

/// SHA-256 of a confirmation key or API token. Only hashes reach the store.
pub(crate) fn hash_secret(value: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.finalize().to_vec()
}

pub(super) fn build_confirm_url(site_url: &str, key: &str) -> String {
    format!("{site_url}/auth/confirm/{key}/")
}

pub(super) fn build_password_reset_url(site_url: &str, uid: &str, token: &str) -> String {
    format!("{site_url}/auth/password/reset/{uid}/{token}/")
}
