//! Auth configuration and the shared state handed to handlers.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{path::PathBuf, sync::Arc};

use super::{passwords::PasswordHasher, passwords::PasswordPolicy, reset_token::ResetTokens};

const DEFAULT_SITE_URL: &str = "http://localhost:8080";
const DEFAULT_SITE_NAME: &str = "innocent";
const DEFAULT_SITE_DOMAIN: &str = "item4.net";
const DEFAULT_EMAIL_FROM: &str = "innocent <noreply@item4.net>";
const DEFAULT_CONFIRMATION_TTL_SECONDS: i64 = 3 * 24 * 60 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 3 * 60;
const DEFAULT_TOKEN_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_PASSWORD_RESET_TIMEOUT_SECONDS: i64 = 3 * 24 * 60 * 60;
const DEFAULT_PASSWORD_MIN_LENGTH: usize = 16;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    site_url: String,
    site_name: String,
    site_domain: String,
    email_from: String,
    confirmation_ttl_seconds: i64,
    resend_cooldown_seconds: i64,
    token_ttl_seconds: i64,
    password_reset_timeout_seconds: i64,
    password_min_length: usize,
    common_passwords_file: Option<PathBuf>,
    password_hash_cost: Option<(u32, u32)>,
}

impl AuthConfig {
    #[must_use]
    pub fn new(site_url: String) -> Self {
        Self {
            site_url: site_url.trim_end_matches('/').to_string(),
            site_name: DEFAULT_SITE_NAME.to_string(),
            site_domain: DEFAULT_SITE_DOMAIN.to_string(),
            email_from: DEFAULT_EMAIL_FROM.to_string(),
            confirmation_ttl_seconds: DEFAULT_CONFIRMATION_TTL_SECONDS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            password_reset_timeout_seconds: DEFAULT_PASSWORD_RESET_TIMEOUT_SECONDS,
            password_min_length: DEFAULT_PASSWORD_MIN_LENGTH,
            common_passwords_file: None,
            password_hash_cost: None,
        }
    }

    #[must_use]
    pub fn with_site_name(mut self, site_name: String) -> Self {
        self.site_name = site_name;
        self
    }

    #[must_use]
    pub fn with_site_domain(mut self, site_domain: String) -> Self {
        self.site_domain = site_domain;
        self
    }

    #[must_use]
    pub fn with_email_from(mut self, email_from: String) -> Self {
        self.email_from = email_from;
        self
    }

    #[must_use]
    pub fn with_confirmation_ttl_seconds(mut self, seconds: i64) -> Self {
        self.confirmation_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: i64) -> Self {
        self.resend_cooldown_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_password_reset_timeout_seconds(mut self, seconds: i64) -> Self {
        self.password_reset_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_password_min_length(mut self, length: usize) -> Self {
        self.password_min_length = length;
        self
    }

    /// Load the common-password list from a file instead of the bundled one.
    #[must_use]
    pub fn with_common_passwords_file(mut self, path: PathBuf) -> Self {
        self.common_passwords_file = Some(path);
        self
    }

    /// Argon2 memory (KiB) and iteration cost for new hashes. Existing hashes
    /// keep verifying with the parameters embedded in them.
    #[must_use]
    pub fn with_password_hash_cost(mut self, memory_kib: u32, iterations: u32) -> Self {
        self.password_hash_cost = Some((memory_kib, iterations));
        self
    }

    #[must_use]
    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    #[must_use]
    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    #[must_use]
    pub fn site_domain(&self) -> &str {
        &self.site_domain
    }

    #[must_use]
    pub fn email_from(&self) -> &str {
        &self.email_from
    }

    #[must_use]
    pub fn confirmation_ttl_seconds(&self) -> i64 {
        self.confirmation_ttl_seconds
    }

    #[must_use]
    pub fn resend_cooldown_seconds(&self) -> i64 {
        self.resend_cooldown_seconds
    }

    #[must_use]
    pub fn token_ttl_seconds(&self) -> i64 {
        self.token_ttl_seconds
    }

    #[must_use]
    pub fn password_reset_timeout_seconds(&self) -> i64 {
        self.password_reset_timeout_seconds
    }

    #[must_use]
    pub fn password_min_length(&self) -> usize {
        self.password_min_length
    }

    pub(super) fn session_cookie_secure(&self) -> bool {
        self.site_url.starts_with("https://")
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SITE_URL.to_string())
    }
}

pub struct AuthState {
    config: AuthConfig,
    policy: PasswordPolicy,
    hasher: PasswordHasher,
    reset_tokens: ResetTokens,
}

impl AuthState {
    /// # Errors
    /// Returns an error if the configured Argon2 cost is out of range, the
    /// hasher cannot be initialized, or the common-password file is unreadable.
    pub fn new(config: AuthConfig, secret_key: SecretString) -> Result<Self> {
        let hasher = match config.password_hash_cost {
            Some((memory_kib, iterations)) => PasswordHasher::with_cost(memory_kib, iterations)?,
            None => PasswordHasher::new()?,
        };
        let mut policy = PasswordPolicy::new(config.password_min_length);
        if let Some(path) = &config.common_passwords_file {
            policy = policy.with_common_passwords_file(path)?;
        }
        Ok(Self {
            policy,
            reset_tokens: ResetTokens::new(secret_key, config.password_reset_timeout_seconds),
            hasher,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub(super) fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    pub(super) fn reset_tokens(&self) -> &ResetTokens {
        &self.reset_tokens
    }

    /// Argon2 runs on the blocking pool.
    pub(super) async fn hash_password(self: &Arc<Self>, password: String) -> Result<String> {
        let state = Arc::clone(self);
        tokio::task::spawn_blocking(move || state.hasher.hash(&password))
            .await
            .context("password hashing task failed")?
    }

    /// Verify against `stored_hash`, or burn a dummy verification when the
    /// account does not exist.
    pub(super) async fn verify_password(
        self: &Arc<Self>,
        password: String,
        stored_hash: Option<String>,
    ) -> Result<bool> {
        let state = Arc::clone(self);
        tokio::task::spawn_blocking(move || match stored_hash {
            Some(stored_hash) => state.hasher.verify(&password, &stored_hash),
            None => {
                state.hasher.verify_dummy(&password);
                false
            }
        })
        .await
        .context("password verification task failed")
    }
}
