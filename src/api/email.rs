//! Outbound e-mail: message type, delivery seam, and the outbox worker.
//!
//! Registration, resend, and password reset never talk to a mail transport
//! directly. They enqueue an [`EmailMessage`] in the store as part of the same
//! unit of work that creates the key the e-mail references, and return.
//! [`spawn_outbox_worker`] polls the store, claims a batch, and hands each row
//! to an [`EmailSender`].
//!
//! Claimed rows carry a lease: the store hides them until the lease runs out,
//! so a worker that dies mid-batch only delays delivery. Failed sends are
//! retried with exponential backoff and jitter until `max_attempts`, then the
//! row is marked `failed`.
//!
//! The default sender is [`LogEmailSender`]. [`MemoryEmailSender`] keeps
//! messages in memory so tests can read confirmation keys out of the body.
use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::store::{DynStore, OutboxUpdate, Pruned, Store};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    pub body: String,
}

/// Email delivery abstraction used by the outbox worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Sender that logs the message instead of delivering it.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            from_email = %message.from_email,
            to_email = %message.to_email,
            subject = %message.subject,
            body = %message.body,
            "email outbox send stub"
        );
        Ok(())
    }
}

/// Sender that records every message it is given.
#[derive(Clone, Debug, Default)]
pub struct MemoryEmailSender {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
}

impl MemoryEmailSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the messages delivered so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

impl EmailSender for MemoryEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow!("memory email sender poisoned"))?
            .push(message.clone());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    claim_lease: Duration,
    retention: Duration,
}

impl EmailWorkerConfig {
    /// 5s poll interval, 10 messages per batch, 5 attempts, 5s to 5m
    /// backoff, a 60s claim lease, and 7 days of retention for finished rows.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            claim_lease: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_claim_lease_seconds(mut self, seconds: u64) -> Self {
        self.claim_lease = Duration::from_secs(seconds);
        self
    }

    /// How long `sent` and `failed` rows are kept before the sweep drops them.
    #[must_use]
    pub fn with_retention_seconds(mut self, seconds: u64) -> Self {
        self.retention = Duration::from_secs(seconds);
        self
    }

    /// Clamp zero values so the worker always makes progress.
    #[must_use]
    pub fn normalize(self) -> Self {
        let non_zero = |value: Duration| {
            if value.is_zero() {
                Duration::from_secs(1)
            } else {
                value
            }
        };
        let backoff_base = non_zero(self.backoff_base);
        Self {
            poll_interval: non_zero(self.poll_interval),
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
            claim_lease: non_zero(self.claim_lease),
            retention: self.retention,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }

    #[must_use]
    pub fn claim_lease(&self) -> Duration {
        self.claim_lease
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that polls and processes the email outbox.
pub fn spawn_outbox_worker(
    store: DynStore,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            match process_outbox_batch(store.as_ref(), sender.as_ref(), &config).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "email outbox batch processed"),
                Err(err) => error!("email outbox batch failed: {err:#}"),
            }

            match sweep_expired(store.as_ref(), &config).await {
                Ok(pruned) if pruned.is_empty() => {}
                Ok(pruned) => debug!(
                    tokens = pruned.tokens,
                    emails = pruned.emails,
                    "expired rows swept"
                ),
                Err(err) => error!("expired row sweep failed: {err:#}"),
            }

            sleep(poll_interval).await;
        }
    })
}

/// Claim one batch of due messages and deliver it. Returns the number of
/// rows claimed.
/// # Errors
/// Returns an error if the store cannot be read or updated.
pub async fn process_outbox_batch(
    store: &dyn Store,
    sender: &dyn EmailSender,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let now = Utc::now();
    let lease_until = now + to_chrono(config.claim_lease());
    let batch = store
        .claim_outbox(config.batch_size(), now, lease_until)
        .await?;

    let row_count = batch.len();
    for email in batch {
        let attempts = email.attempts.saturating_add(1);
        let update = match sender.send(&email.message) {
            Ok(()) => OutboxUpdate::Sent { attempts },
            Err(err) if attempts >= config.max_attempts() => {
                warn!(
                    to_email = %email.message.to_email,
                    attempts,
                    "giving up on email: {err:#}"
                );
                OutboxUpdate::Failed {
                    attempts,
                    error: err.to_string(),
                }
            }
            Err(err) => {
                let delay = backoff_delay(attempts, config.backoff_base(), config.backoff_max());
                OutboxUpdate::Retry {
                    attempts,
                    error: err.to_string(),
                    next_attempt_at: Utc::now() + to_chrono(delay),
                }
            }
        };
        store.complete_outbox(email.id, update).await?;
    }

    Ok(row_count)
}

/// Drop expired API tokens and finished outbox rows past the retention window.
/// # Errors
/// Returns an error if the store cannot be updated.
pub async fn sweep_expired(store: &dyn Store, config: &EmailWorkerConfig) -> Result<Pruned> {
    let now = Utc::now();
    store
        .prune(now, now - to_chrono(config.retention()))
        .await
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    jitter_delay(delay.min(max))
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
