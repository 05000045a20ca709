//! Site, token, and e-mail outbox options.

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::path::PathBuf;

pub const ARG_SECRET_KEY: &str = "secret-key";
pub const ARG_SITE_URL: &str = "site-url";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_site_args(command);
    let command = with_token_args(command);
    with_outbox_args(command)
}

fn with_site_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SECRET_KEY)
                .long(ARG_SECRET_KEY)
                .help("Secret used to sign password reset tokens")
                .env("INNOCENT_SECRET_KEY")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_SITE_URL)
                .long(ARG_SITE_URL)
                .help("Public base URL used in e-mail links and as the CORS origin")
                .env("INNOCENT_SITE_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new("site-name")
                .long("site-name")
                .help("Site name used in e-mail subjects")
                .env("INNOCENT_SITE_NAME")
                .default_value("innocent"),
        )
        .arg(
            Arg::new("site-domain")
                .long("site-domain")
                .help("Site domain used in e-mail subjects")
                .env("INNOCENT_SITE_DOMAIN")
                .default_value("item4.net"),
        )
        .arg(
            Arg::new("email-from")
                .long("email-from")
                .help("Sender address for outgoing e-mail")
                .env("INNOCENT_EMAIL_FROM")
                .default_value("innocent <noreply@item4.net>"),
        )
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("confirmation-ttl-seconds")
                .long("confirmation-ttl-seconds")
                .help("E-mail confirmation key lifetime in seconds")
                .env("INNOCENT_CONFIRMATION_TTL_SECONDS")
                .default_value("259200")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("resend-cooldown-seconds")
                .long("resend-cooldown-seconds")
                .help("Cooldown before another confirmation e-mail is sent")
                .env("INNOCENT_RESEND_COOLDOWN_SECONDS")
                .default_value("180")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("token-ttl-seconds")
                .long("token-ttl-seconds")
                .help("API token and session cookie lifetime in seconds")
                .env("INNOCENT_TOKEN_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("password-reset-timeout-seconds")
                .long("password-reset-timeout-seconds")
                .help("Password reset token lifetime in seconds")
                .env("INNOCENT_PASSWORD_RESET_TIMEOUT_SECONDS")
                .default_value("259200")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("password-min-length")
                .long("password-min-length")
                .help("Minimum password length")
                .env("INNOCENT_PASSWORD_MIN_LENGTH")
                .default_value("16")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("common-passwords-file")
                .long("common-passwords-file")
                .help("Common password list, plain or gzip, replacing the bundled one")
                .env("INNOCENT_COMMON_PASSWORDS_FILE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
}

fn with_outbox_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("email-outbox-poll-seconds")
                .long("email-outbox-poll-seconds")
                .help("E-mail outbox poll interval in seconds")
                .env("INNOCENT_EMAIL_OUTBOX_POLL_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-batch-size")
                .long("email-outbox-batch-size")
                .help("E-mail outbox rows claimed per poll")
                .env("INNOCENT_EMAIL_OUTBOX_BATCH_SIZE")
                .default_value("10")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("email-outbox-max-attempts")
                .long("email-outbox-max-attempts")
                .help("Attempts before an e-mail is marked failed")
                .env("INNOCENT_EMAIL_OUTBOX_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("email-outbox-backoff-base-seconds")
                .long("email-outbox-backoff-base-seconds")
                .help("Base delay for e-mail retry backoff")
                .env("INNOCENT_EMAIL_OUTBOX_BACKOFF_BASE_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-backoff-max-seconds")
                .long("email-outbox-backoff-max-seconds")
                .help("Max delay for e-mail retry backoff")
                .env("INNOCENT_EMAIL_OUTBOX_BACKOFF_MAX_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("email-outbox-retention-seconds")
                .long("email-outbox-retention-seconds")
                .help("How long sent and failed e-mails are kept before being swept")
                .env("INNOCENT_EMAIL_OUTBOX_RETENTION_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[derive(Debug)]
pub struct OutboxOptions {
    pub poll_seconds: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    pub retention_seconds: u64,
}

#[derive(Debug)]
pub struct Options {
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
    pub email_outbox: OutboxOptions,
}

fn required<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, name: &str) -> Result<T> {
    matches
        .get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing required argument: --{name}"))
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let secret_key: String = required(matches, ARG_SECRET_KEY)?;
        Ok(Self {
            secret_key: SecretString::from(secret_key),
            site_url: required(matches, ARG_SITE_URL)?,
            site_name: required(matches, "site-name")?,
            site_domain: required(matches, "site-domain")?,
            email_from: required(matches, "email-from")?,
            confirmation_ttl_seconds: required(matches, "confirmation-ttl-seconds")?,
            resend_cooldown_seconds: required(matches, "resend-cooldown-seconds")?,
            token_ttl_seconds: required(matches, "token-ttl-seconds")?,
            password_reset_timeout_seconds: required(matches, "password-reset-timeout-seconds")?,
            password_min_length: required(matches, "password-min-length")?,
            common_passwords_file: matches.get_one::<PathBuf>("common-passwords-file").cloned(),
            email_outbox: OutboxOptions {
                poll_seconds: required(matches, "email-outbox-poll-seconds")?,
                batch_size: required(matches, "email-outbox-batch-size")?,
                max_attempts: required(matches, "email-outbox-max-attempts")?,
                backoff_base_seconds: required(matches, "email-outbox-backoff-base-seconds")?,
                backoff_max_seconds: required(matches, "email-outbox-backoff-max-seconds")?,
                retention_seconds: required(matches, "email-outbox-retention-seconds")?,
            },
        })
    }
}
