//! Persistence for accounts, e-mail verification, API tokens, and the e-mail outbox.
//!
//! Handlers only talk to the [`Store`] trait. Two backends exist:
//!
//! - [`PgStore`]: Postgres through `sqlx`, schema in `sql/schema.sql`.
//! - [`MemoryStore`]: process-local maps behind a single mutex, used when no
//!   DSN is configured and by the test-suite.
//!
//! Raw confirmation keys and API tokens never reach the store; callers pass
//! SHA-256 hashes and keep the raw values only long enough to hand them to
//! the user.
//!
//! Every method is a single unit of work. Registration creates the user, the
//! primary e-mail address, the confirmation key, and the outbox row together
//! so a failure never leaves a user without a way to verify.

mod memory;
mod postgres;

pub use memory::MemoryStore;
#[cfg(test)]
pub(crate) use memory::OutboxStatus;
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::email::EmailMessage;

/// Shared handle used by handlers and the outbox worker.
pub type DynStore = Arc<dyn Store>;

#[derive(Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub tz: String,
    pub password_hash: String,
    pub email_verified: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub date_joined: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub tz: String,
    pub password_hash: String,
    /// Accounts provisioned out of band may start verified.
    pub email_verified: bool,
}

/// Confirmation key plus the e-mail announcing it, written with the user.
#[derive(Clone, Debug)]
pub struct NewConfirmation {
    pub key_hash: Vec<u8>,
    pub message: EmailMessage,
}

#[derive(Debug)]
pub enum CreateUserOutcome {
    Created(User),
    EmailTaken,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResendOutcome {
    Queued,
    Cooldown,
    Noop,
}

#[derive(Clone, Debug)]
pub struct OutboxEmail {
    pub id: Uuid,
    pub message: EmailMessage,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub enum OutboxUpdate {
    Sent {
        attempts: u32,
    },
    Retry {
        attempts: u32,
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        attempts: u32,
        error: String,
    },
}

/// Rows removed by [`Store::prune`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pruned {
    pub tokens: u64,
    pub emails: u64,
}

impl Pruned {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens == 0 && self.emails == 0
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness check used by `/health`.
    async fn ping(&self) -> Result<()>;

    /// Create a user with its primary e-mail address, optionally together
    /// with a pending confirmation and its outbox e-mail.
    async fn create_user(
        &self,
        user: NewUser,
        confirmation: Option<NewConfirmation>,
    ) -> Result<CreateUserOutcome>;

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn email_address_exists(&self, email: &str) -> Result<bool>;

    async fn set_password(&self, user_id: Uuid, password_hash: &str) -> Result<()>;

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn update_profile(&self, user_id: Uuid, name: &str, tz: &str) -> Result<()>;

    /// Whether a confirmation with this key was created after `not_before`.
    async fn confirmation_exists(&self, key_hash: &[u8], not_before: DateTime<Utc>) -> Result<bool>;

    /// Mark the address verified and consume every confirmation for it.
    /// Returns `false` when the key is unknown or older than `not_before`.
    async fn confirm_email(&self, key_hash: &[u8], not_before: DateTime<Utc>) -> Result<bool>;

    /// Queue a fresh confirmation for an unverified address unless one was
    /// created within the cooldown window (after `cooldown_since`).
    async fn queue_confirmation(
        &self,
        email: &str,
        confirmation: NewConfirmation,
        cooldown_since: DateTime<Utc>,
    ) -> Result<ResendOutcome>;

    async fn insert_token(
        &self,
        user_id: Uuid,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Resolve an unexpired token of an active user.
    async fn user_by_token(&self, token_hash: &[u8], now: DateTime<Utc>) -> Result<Option<User>>;

    async fn delete_token(&self, token_hash: &[u8]) -> Result<()>;

    async fn delete_user_tokens(&self, user_id: Uuid) -> Result<u64>;

    async fn enqueue_email(&self, message: EmailMessage) -> Result<()>;

    /// Claim up to `limit` due outbox rows. Claimed rows are hidden from other
    /// workers until `lease_until`, after which they become due again.
    async fn claim_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEmail>>;

    async fn complete_outbox(&self, id: Uuid, update: OutboxUpdate) -> Result<()>;

    /// Delete tokens expired at `now`, and `sent`/`failed` outbox rows that
    /// finished before `finished_before`. Pending rows are never touched.
    async fn prune(&self, now: DateTime<Utc>, finished_before: DateTime<Utc>) -> Result<Pruned>;
}
