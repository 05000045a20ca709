use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    Connection, PgPool, Postgres, Row, Transaction,
};
use std::time::Duration;
use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

use super::{
    CreateUserOutcome, NewConfirmation, NewUser, OutboxEmail, OutboxUpdate, Pruned, ResendOutcome,
    Store, User,
};
use crate::api::email::EmailMessage;

const USER_COLUMNS: &str = r"
    users.id, users.email, users.name, users.tz, users.password_hash,
    users.last_login, users.date_joined,
    COALESCE(email_addresses.verified, FALSE) AS email_verified
";

/// Postgres-backed store. Expects the schema from `sql/schema.sql`.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a small pool; connections are recycled every two minutes.
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    async fn user_where(&self, clause: &str, bind: UserKey<'_>) -> Result<Option<User>> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users \
             LEFT JOIN email_addresses \
               ON email_addresses.user_id = users.id AND email_addresses.is_primary \
             WHERE {clause}"
        );
        let span = db_span("SELECT", &query);
        let query = sqlx::query(&query);
        let query = match bind {
            UserKey::Id(id) => query.bind(id),
            UserKey::Email(email) => query.bind(email),
        };
        let row = query
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user")?;
        Ok(row.as_ref().map(user_from_row))
    }
}

enum UserKey<'a> {
    Id(Uuid),
    Email(&'a str),
}

fn db_span(operation: &str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        tz: row.get("tz"),
        password_hash: row.get("password_hash"),
        email_verified: row.get("email_verified"),
        last_login: row.get("last_login"),
        date_joined: row.get("date_joined"),
    }
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

async fn insert_confirmation(
    tx: &mut Transaction<'_, Postgres>,
    email_address_id: Uuid,
    confirmation: &NewConfirmation,
) -> Result<()> {
    let query = r"
        INSERT INTO email_confirmations (key_hash, email_address_id)
        VALUES ($1, $2)
    ";
    sqlx::query(query)
        .bind(&confirmation.key_hash)
        .bind(email_address_id)
        .execute(&mut **tx)
        .instrument(db_span("INSERT", query))
        .await
        .context("failed to insert email confirmation")?;

    insert_outbox(tx, &confirmation.message).await
}

async fn insert_outbox(tx: &mut Transaction<'_, Postgres>, message: &EmailMessage) -> Result<()> {
    let query = r"
        INSERT INTO email_outbox (from_email, to_email, subject, body)
        VALUES ($1, $2, $3, $4)
    ";
    sqlx::query(query)
        .bind(&message.from_email)
        .bind(&message.to_email)
        .bind(&message.subject)
        .bind(&message.body)
        .execute(&mut **tx)
        .instrument(db_span("INSERT", query))
        .await
        .context("failed to insert email outbox row")?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<()> {
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .context("failed to acquire database connection")?;
        let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping()
            .instrument(ping_span)
            .await
            .context("failed to ping database")
    }

    async fn create_user(
        &self,
        user: NewUser,
        confirmation: Option<NewConfirmation>,
    ) -> Result<CreateUserOutcome> {
        // User, address, confirmation, and outbox row commit together.
        let mut tx = self.pool.begin().await.context("begin signup transaction")?;

        let query = r"
            INSERT INTO users (email, name, tz, password_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, date_joined
        ";
        let row = sqlx::query(query)
            .bind(&user.email)
            .bind(&user.name)
            .bind(&user.tz)
            .bind(&user.password_hash)
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await;
        let row = match row {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => {
                let _ = tx.rollback().await;
                return Ok(CreateUserOutcome::EmailTaken);
            }
            Err(err) => return Err(err).context("failed to insert user"),
        };
        let user_id: Uuid = row.get("id");
        let date_joined: DateTime<Utc> = row.get("date_joined");

        let query = r"
            INSERT INTO email_addresses (user_id, email, verified, is_primary)
            VALUES ($1, $2, $3, TRUE)
            RETURNING id
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(&user.email)
            .bind(user.email_verified)
            .fetch_one(&mut *tx)
            .instrument(db_span("INSERT", query))
            .await;
        let email_address_id: Uuid = match row {
            Ok(row) => row.get("id"),
            Err(err) if is_unique_violation(&err) => {
                let _ = tx.rollback().await;
                return Ok(CreateUserOutcome::EmailTaken);
            }
            Err(err) => return Err(err).context("failed to insert email address"),
        };

        if let Some(confirmation) = &confirmation {
            insert_confirmation(&mut tx, email_address_id, confirmation).await?;
        }

        tx.commit().await.context("commit signup transaction")?;

        Ok(CreateUserOutcome::Created(User {
            id: user_id,
            email: user.email,
            name: user.name,
            tz: user.tz,
            password_hash: user.password_hash,
            email_verified: user.email_verified,
            last_login: None,
            date_joined,
        }))
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.user_where("users.id = $1", UserKey::Id(id)).await
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.user_where("users.email = $1", UserKey::Email(email))
            .await
    }

    async fn email_address_exists(&self, email: &str) -> Result<bool> {
        let query = "SELECT EXISTS(SELECT 1 FROM email_addresses WHERE email = $1) AS exists";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to check email address")?;
        Ok(row.get("exists"))
    }

    async fn set_password(&self, user_id: Uuid, password_hash: &str) -> Result<()> {
        let query = "UPDATE users SET password_hash = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update password")?;
        Ok(())
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = "UPDATE users SET last_login = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to record login")?;
        Ok(())
    }

    async fn update_profile(&self, user_id: Uuid, name: &str, tz: &str) -> Result<()> {
        let query = "UPDATE users SET name = $2, tz = $3 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(name)
            .bind(tz)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to update profile")?;
        Ok(())
    }

    async fn confirmation_exists(&self, key_hash: &[u8], not_before: DateTime<Utc>) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM email_confirmations
                WHERE key_hash = $1 AND created_at >= $2
            )
        ";
        let exists: bool = sqlx::query_scalar(query)
            .bind(key_hash)
            .bind(not_before)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup email confirmation")?;
        Ok(exists)
    }

    async fn confirm_email(&self, key_hash: &[u8], not_before: DateTime<Utc>) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin confirm-email transaction")?;

        let query = r"
            DELETE FROM email_confirmations
            WHERE key_hash = $1 AND created_at >= $2
            RETURNING email_address_id
        ";
        let row = sqlx::query(query)
            .bind(key_hash)
            .bind(not_before)
            .fetch_optional(&mut *tx)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to consume email confirmation")?;
        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Ok(false);
        };
        let email_address_id: Uuid = row.get("email_address_id");

        let query = "UPDATE email_addresses SET verified = TRUE WHERE id = $1";
        sqlx::query(query)
            .bind(email_address_id)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to mark email verified")?;

        let query = "DELETE FROM email_confirmations WHERE email_address_id = $1";
        sqlx::query(query)
            .bind(email_address_id)
            .execute(&mut *tx)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to clear email confirmations")?;

        tx.commit()
            .await
            .context("commit confirm-email transaction")?;
        Ok(true)
    }

    async fn queue_confirmation(
        &self,
        email: &str,
        confirmation: NewConfirmation,
        cooldown_since: DateTime<Utc>,
    ) -> Result<ResendOutcome> {
        let mut tx = self.pool.begin().await.context("begin resend transaction")?;

        // Lock the address row so concurrent resends serialize on the cooldown check.
        let query = "SELECT id, verified FROM email_addresses WHERE email = $1 FOR UPDATE";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup email address")?;
        let email_address_id: Uuid = match row {
            Some(row) if !row.get::<bool, _>("verified") => row.get("id"),
            _ => {
                let _ = tx.rollback().await;
                return Ok(ResendOutcome::Noop);
            }
        };

        let query = r"
            SELECT EXISTS(
                SELECT 1 FROM email_confirmations
                WHERE email_address_id = $1 AND created_at > $2
            ) AS recent
        ";
        let row = sqlx::query(query)
            .bind(email_address_id)
            .bind(cooldown_since)
            .fetch_one(&mut *tx)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to check resend cooldown")?;
        if row.get::<bool, _>("recent") {
            let _ = tx.rollback().await;
            return Ok(ResendOutcome::Cooldown);
        }

        insert_confirmation(&mut tx, email_address_id, &confirmation).await?;
        tx.commit().await.context("commit resend transaction")?;
        Ok(ResendOutcome::Queued)
    }

    async fn insert_token(
        &self,
        user_id: Uuid,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = r"
            INSERT INTO auth_tokens (token_hash, user_id, expires_at)
            VALUES ($1, $2, $3)
        ";
        sqlx::query(query)
            .bind(token_hash)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to insert auth token")?;
        Ok(())
    }

    async fn user_by_token(&self, token_hash: &[u8], now: DateTime<Utc>) -> Result<Option<User>> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM auth_tokens \
             JOIN users ON users.id = auth_tokens.user_id \
             LEFT JOIN email_addresses \
               ON email_addresses.user_id = users.id AND email_addresses.is_primary \
             WHERE auth_tokens.token_hash = $1 \
               AND auth_tokens.expires_at > $2"
        );
        let span = db_span("SELECT", &query);
        let row = sqlx::query(&query)
            .bind(token_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup auth token")?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn delete_token(&self, token_hash: &[u8]) -> Result<()> {
        let query = "DELETE FROM auth_tokens WHERE token_hash = $1";
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to delete auth token")?;
        Ok(())
    }

    async fn delete_user_tokens(&self, user_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM auth_tokens WHERE user_id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to delete auth tokens")?;
        Ok(result.rows_affected())
    }

    async fn enqueue_email(&self, message: EmailMessage) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin outbox transaction")?;
        insert_outbox(&mut tx, &message).await?;
        tx.commit().await.context("commit outbox transaction")?;
        Ok(())
    }

    async fn claim_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxEmail>> {
        // SKIP LOCKED lets several workers claim disjoint batches; pushing
        // next_attempt_at forward hides the rows until the lease runs out.
        let query = r"
            UPDATE email_outbox
            SET next_attempt_at = $3
            WHERE id IN (
                SELECT id FROM email_outbox
                WHERE status = 'pending'
                  AND next_attempt_at <= $2
                ORDER BY next_attempt_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, from_email, to_email, subject, body, attempts
        ";
        let rows = sqlx::query(query)
            .bind(i64::try_from(limit).unwrap_or(0))
            .bind(now)
            .bind(lease_until)
            .fetch_all(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to claim email outbox batch")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let attempts: i32 = row.get("attempts");
                OutboxEmail {
                    id: row.get("id"),
                    message: EmailMessage {
                        from_email: row.get("from_email"),
                        to_email: row.get("to_email"),
                        subject: row.get("subject"),
                        body: row.get("body"),
                    },
                    attempts: u32::try_from(attempts).unwrap_or(0),
                }
            })
            .collect())
    }

    async fn complete_outbox(&self, id: Uuid, update: OutboxUpdate) -> Result<()> {
        match update {
            OutboxUpdate::Sent { attempts } => {
                let query = r"
                    UPDATE email_outbox
                    SET status = 'sent',
                        attempts = $2,
                        last_error = NULL,
                        sent_at = NOW(),
                        next_attempt_at = NOW()
                    WHERE id = $1
                ";
                sqlx::query(query)
                    .bind(id)
                    .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
                    .execute(&self.pool)
                    .instrument(db_span("UPDATE", query))
                    .await
                    .context("failed to update outbox status to sent")?;
            }
            OutboxUpdate::Retry {
                attempts,
                error,
                next_attempt_at,
            } => {
                let query = r"
                    UPDATE email_outbox
                    SET status = 'pending',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = $4
                    WHERE id = $1
                ";
                sqlx::query(query)
                    .bind(id)
                    .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
                    .bind(error)
                    .bind(next_attempt_at)
                    .execute(&self.pool)
                    .instrument(db_span("UPDATE", query))
                    .await
                    .context("failed to update outbox retry schedule")?;
            }
            OutboxUpdate::Failed { attempts, error } => {
                let query = r"
                    UPDATE email_outbox
                    SET status = 'failed',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW()
                    WHERE id = $1
                ";
                sqlx::query(query)
                    .bind(id)
                    .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
                    .bind(error)
                    .execute(&self.pool)
                    .instrument(db_span("UPDATE", query))
                    .await
                    .context("failed to update outbox status to failed")?;
            }
        }
        Ok(())
    }

    async fn prune(&self, now: DateTime<Utc>, finished_before: DateTime<Utc>) -> Result<Pruned> {
        let query = "DELETE FROM auth_tokens WHERE expires_at <= $1";
        let tokens = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to prune expired auth tokens")?
            .rows_affected();

        // Finished rows have `next_attempt_at` set to their completion time.
        let query = r"
            DELETE FROM email_outbox
            WHERE status IN ('sent', 'failed') AND next_attempt_at < $1
        ";
        let emails = sqlx::query(query)
            .bind(finished_before)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to prune finished outbox rows")?
            .rows_affected();

        Ok(Pruned { tokens, emails })
    }
}
