use crate::{
    api,
    store::{DynStore, MemoryStore, PgStore},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub secret_key: SecretString,
    pub site_url: String,
    pub site_name: String,
    pub site_domain: String,
    pub email_from: String,
    pub confirmation_ttl_seconds: i64,
    pub resend_cooldown_seconds: i64,
    pub token_ttl_seconds: i64,
    pub password_reset_timeout_seconds: i64,
    pub password_min_length: usize,
    pub common_passwords_file: Option<PathBuf>,
    pub email_outbox_poll_seconds: u64,
    pub email_outbox_batch_size: usize,
    pub email_outbox_max_attempts: u32,
    pub email_outbox_backoff_base_seconds: u64,
    pub email_outbox_backoff_max_seconds: u64,
    pub email_outbox_retention_seconds: u64,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let store: DynStore = match &args.dsn {
        Some(dsn) => {
            let store = PgStore::connect(dsn)
                .await
                .context("Failed to connect to database")?;
            info!("Using Postgres store");
            Arc::new(store)
        }
        None => {
            warn!("No DSN configured, accounts are kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let mut auth_config = api::handlers::auth::AuthConfig::new(args.site_url)
        .with_site_name(args.site_name)
        .with_site_domain(args.site_domain)
        .with_email_from(args.email_from)
        .with_confirmation_ttl_seconds(args.confirmation_ttl_seconds)
        .with_resend_cooldown_seconds(args.resend_cooldown_seconds)
        .with_token_ttl_seconds(args.token_ttl_seconds)
        .with_password_reset_timeout_seconds(args.password_reset_timeout_seconds)
        .with_password_min_length(args.password_min_length);
    if let Some(path) = args.common_passwords_file {
        auth_config = auth_config.with_common_passwords_file(path);
    }

    let email_config = api::email::EmailWorkerConfig::new()
        .with_poll_interval_seconds(args.email_outbox_poll_seconds)
        .with_batch_size(args.email_outbox_batch_size)
        .with_max_attempts(args.email_outbox_max_attempts)
        .with_backoff_base_seconds(args.email_outbox_backoff_base_seconds)
        .with_backoff_max_seconds(args.email_outbox_backoff_max_seconds)
        .with_retention_seconds(args.email_outbox_retention_seconds);

    api::new(
        args.port,
        store,
        auth_config,
        args.secret_key,
        email_config,
    )
    .await
}
