//! Stateless password-reset tokens.
//!
//! A token is `<timestamp base36>-<hex MAC>`. The MAC covers the user id, the
//! current password hash, the last login, the timestamp, and the e-mail, so a
//! token stops working once the password changes or the user logs in.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use uuid::Uuid;

use crate::store::User;

type HmacSha256 = Hmac<Sha256>;

const KEY_SALT: &[u8] = b"innocent.auth.PasswordResetTokenGenerator";
const MAC_BYTES: usize = 16;

pub struct ResetTokens {
    secret: SecretString,
    timeout_seconds: i64,
}

impl ResetTokens {
    #[must_use]
    pub fn new(secret: SecretString, timeout_seconds: i64) -> Self {
        Self {
            secret,
            timeout_seconds,
        }
    }

    /// # Errors
    /// Returns an error if the MAC cannot be keyed.
    pub fn make(&self, user: &User, now: DateTime<Utc>) -> Result<String> {
        let timestamp = u64::try_from(now.timestamp()).unwrap_or(0);
        let mac = self.mac(user, timestamp)?.finalize().into_bytes();
        Ok(format!(
            "{}-{}",
            to_base36(timestamp),
            hex::encode(&mac[..MAC_BYTES])
        ))
    }

    #[must_use]
    pub fn check(&self, user: &User, token: &str, now: DateTime<Utc>) -> bool {
        let Some((timestamp, tag)) = token.split_once('-') else {
            return false;
        };
        let Some(timestamp) = from_base36(timestamp) else {
            return false;
        };
        let Ok(tag) = hex::decode(tag) else {
            return false;
        };
        if tag.len() != MAC_BYTES {
            return false;
        }
        let Ok(mac) = self.mac(user, timestamp) else {
            return false;
        };
        if mac.verify_truncated_left(&tag).is_err() {
            return false;
        }

        let age = now.timestamp() - i64::try_from(timestamp).unwrap_or(i64::MAX);
        age <= self.timeout_seconds
    }

    fn mac(&self, user: &User, timestamp: u64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|err| anyhow!("invalid reset token key: {err}"))?;
        let last_login = user
            .last_login
            .map(|at| at.timestamp_micros().to_string())
            .unwrap_or_default();
        for part in [
            KEY_SALT,
            user.id.as_bytes().as_slice(),
            user.password_hash.as_bytes(),
            last_login.as_bytes(),
            timestamp.to_string().as_bytes(),
            user.email.as_bytes(),
        ] {
            mac.update(part);
            mac.update(b"\x1f");
        }
        Ok(mac)
    }
}

/// URL-safe id segment used in reset links.
#[must_use]
pub fn encode_uid(id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

#[must_use]
pub fn decode_uid(uid: &str) -> Option<Uuid> {
    let bytes = URL_SAFE_NO_PAD.decode(uid.trim()).ok()?;
    Uuid::from_slice(&bytes).ok()
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[usize::try_from(value % 36).unwrap_or(0)]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn from_base36(value: &str) -> Option<u64> {
    if value.is_empty() || value.len() > 13 {
        return None;
    }
    u64::from_str_radix(value, 36).ok()
}
