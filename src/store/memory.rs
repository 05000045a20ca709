use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CreateUserOutcome, NewConfirmation, NewUser, OutboxEmail, OutboxUpdate, Pruned, ResendOutcome,
    Store, User,
};
use crate::api::email::EmailMessage;

/// In-memory store.
///
/// All state lives behind one mutex so every trait method is atomic. Nothing
/// survives a restart and nothing is shared between processes, so this is
/// only suitable for development and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    addresses: HashMap<String, AddressRow>,
    confirmations: HashMap<Vec<u8>, ConfirmationRow>,
    tokens: HashMap<Vec<u8>, TokenRow>,
    outbox: Vec<OutboxRow>,
}

struct AddressRow {
    user_id: Uuid,
    verified: bool,
}

struct ConfirmationRow {
    email: String,
    created_at: DateTime<Utc>,
}

struct TokenRow {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

struct OutboxRow {
    id: Uuid,
    message: EmailMessage,
    status: OutboxStatus,
    attempts: u32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl Inner {
    fn hydrate(&self, user: &User) -> User {
        let mut user = user.clone();
        user.email_verified = self
            .addresses
            .get(&user.email)
            .is_some_and(|address| address.verified);
        user
    }

    fn push_outbox(&mut self, message: EmailMessage, now: DateTime<Utc>) {
        self.outbox.push(OutboxRow {
            id: Uuid::new_v4(),
            message,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
        });
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outbox rows still waiting for delivery.
    pub async fn pending_emails(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .outbox
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .count()
    }

    #[cfg(test)]
    pub(crate) async fn outbox_rows(&self) -> Vec<(Uuid, OutboxStatus, u32, Option<String>)> {
        let inner = self.inner.lock().await;
        inner
            .outbox
            .iter()
            .map(|row| (row.id, row.status, row.attempts, row.last_error.clone()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn token_count(&self) -> usize {
        self.inner.lock().await.tokens.len()
    }

    #[cfg(test)]
    pub(crate) async fn age_confirmations(&self, by: chrono::Duration) {
        let mut inner = self.inner.lock().await;
        for row in inner.confirmations.values_mut() {
            row.created_at -= by;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_user(
        &self,
        user: NewUser,
        confirmation: Option<NewConfirmation>,
    ) -> Result<CreateUserOutcome> {
        let mut inner = self.inner.lock().await;
        if inner.addresses.contains_key(&user.email) {
            return Ok(CreateUserOutcome::EmailTaken);
        }

        let now = Utc::now();
        let record = User {
            id: Uuid::new_v4(),
            email: user.email.clone(),
            name: user.name,
            tz: user.tz,
            password_hash: user.password_hash,
            email_verified: user.email_verified,
            last_login: None,
            date_joined: now,
        };

        inner.addresses.insert(
            user.email.clone(),
            AddressRow {
                user_id: record.id,
                verified: user.email_verified,
            },
        );
        inner.users.insert(record.id, record.clone());

        if let Some(confirmation) = confirmation {
            inner.confirmations.insert(
                confirmation.key_hash,
                ConfirmationRow {
                    email: user.email,
                    created_at: now,
                },
            );
            inner.push_outbox(confirmation.message, now);
        }

        Ok(CreateUserOutcome::Created(record))
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(&id).map(|user| inner.hydrate(user)))
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|user| user.email == email)
            .map(|user| inner.hydrate(user)))
    }

    async fn email_address_exists(&self, email: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.addresses.contains_key(email))
    }

    async fn set_password(&self, user_id: Uuid, password_hash: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.password_hash = password_hash.to_string();
        }
        Ok(())
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.last_login = Some(at);
        }
        Ok(())
    }

    async fn update_profile(&self, user_id: Uuid, name: &str, tz: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.name = name.to_string();
            user.tz = tz.to_string();
        }
        Ok(())
    }

    async fn confirmation_exists(&self, key_hash: &[u8], not_before: DateTime<Utc>) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.confirmations.get(key_hash).is_some_and(|row| {
            row.created_at >= not_before && inner.addresses.contains_key(&row.email)
        }))
    }

    async fn confirm_email(&self, key_hash: &[u8], not_before: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let email = match inner.confirmations.get(key_hash) {
            Some(row) if row.created_at >= not_before => row.email.clone(),
            _ => return Ok(false),
        };
        let Some(address) = inner.addresses.get_mut(&email) else {
            return Ok(false);
        };
        address.verified = true;
        inner.confirmations.retain(|_, row| row.email != email);
        Ok(true)
    }

    async fn queue_confirmation(
        &self,
        email: &str,
        confirmation: NewConfirmation,
        cooldown_since: DateTime<Utc>,
    ) -> Result<ResendOutcome> {
        let mut inner = self.inner.lock().await;
        match inner.addresses.get(email) {
            Some(address) if !address.verified => {}
            _ => return Ok(ResendOutcome::Noop),
        }

        let recent = inner
            .confirmations
            .values()
            .any(|row| row.email == email && row.created_at > cooldown_since);
        if recent {
            return Ok(ResendOutcome::Cooldown);
        }

        let now = Utc::now();
        inner.confirmations.insert(
            confirmation.key_hash,
            ConfirmationRow {
                email: email.to_string(),
                created_at: now,
            },
        );
        inner.push_outbox(confirmation.message, now);
        Ok(ResendOutcome::Queued)
    }

    async fn insert_token(
        &self,
        user_id: Uuid,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tokens.insert(
            token_hash.to_vec(),
            TokenRow {
                user_id,
                expires_at,
            },
        );
        Ok(())
    }

    async fn user_by_token(&self, token_hash: &[u8], now: DateTime<Utc>) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        let Some(token) = inner.tokens.get(token_hash) else {
            return Ok(None);
        };
        if token.expires_at <= now {
            return Ok(None);
        }
        Ok(inner
            .users
            .get(&token.user_id)
            .map(|user| inner.hydrate(user)))
    }

    async fn delete_token(&self, token_hash: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tokens.remove(token_hash);
        Ok(())
    }

    async fn delete_user_tokens(&self, user_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.tokens.len();
        inner.tokens.retain(|_, token| token.user_id != user_id);
        Ok(u64::try_from(before - inner.tokens.len()).unwrap_or(u64::MAX))
    }

    async fn enqueue_email(&self, message: EmailMessage) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.push_outbox(message, Utc::now());
        Ok(())
    }

    async fn claim_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEmail>> {
        let mut inner = self.inner.lock().await;
        let mut due: Vec<&mut OutboxRow> = inner
            .outbox
            .iter_mut()
            .filter(|row| row.status == OutboxStatus::Pending && row.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|row| (row.next_attempt_at, row.created_at));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|row| {
                row.next_attempt_at = lease_until;
                OutboxEmail {
                    id: row.id,
                    message: row.message.clone(),
                    attempts: row.attempts,
                }
            })
            .collect())
    }

    async fn complete_outbox(&self, id: Uuid, update: OutboxUpdate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.outbox.iter_mut().find(|row| row.id == id) else {
            return Ok(());
        };
        match update {
            OutboxUpdate::Sent { attempts } => {
                row.status = OutboxStatus::Sent;
                row.attempts = attempts;
                row.last_error = None;
                row.next_attempt_at = Utc::now();
            }
            OutboxUpdate::Retry {
                attempts,
                error,
                next_attempt_at,
            } => {
                row.status = OutboxStatus::Pending;
                row.attempts = attempts;
                row.last_error = Some(error);
                row.next_attempt_at = next_attempt_at;
            }
            OutboxUpdate::Failed { attempts, error } => {
                row.status = OutboxStatus::Failed;
                row.attempts = attempts;
                row.last_error = Some(error);
                row.next_attempt_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn prune(&self, now: DateTime<Utc>, finished_before: DateTime<Utc>) -> Result<Pruned> {
        let mut inner = self.inner.lock().await;
        let tokens_before = inner.tokens.len();
        inner.tokens.retain(|_, token| token.expires_at > now);
        let emails_before = inner.outbox.len();
        // Finished rows keep their completion time in `next_attempt_at`.
        inner.outbox.retain(|row| {
            row.status == OutboxStatus::Pending || row.next_attempt_at >= finished_before
        });
        Ok(Pruned {
            tokens: u64::try_from(tokens_before - inner.tokens.len()).unwrap_or(u64::MAX),
            emails: u64::try_from(emails_before - inner.outbox.len()).unwrap_or(u64::MAX),
        })
    }
}
