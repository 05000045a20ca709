//! Map parsed CLI arguments to the action to run.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::auth;
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches.get_one::<String>("dsn").cloned();
    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        secret_key: auth_opts.secret_key,
        site_url: auth_opts.site_url,
        site_name: auth_opts.site_name,
        site_domain: auth_opts.site_domain,
        email_from: auth_opts.email_from,
        confirmation_ttl_seconds: auth_opts.confirmation_ttl_seconds,
        resend_cooldown_seconds: auth_opts.resend_cooldown_seconds,
        token_ttl_seconds: auth_opts.token_ttl_seconds,
        password_reset_timeout_seconds: auth_opts.password_reset_timeout_seconds,
        password_min_length: auth_opts.password_min_length,
        common_passwords_file: auth_opts.common_passwords_file,
        email_outbox_poll_seconds: auth_opts.email_outbox.poll_seconds,
        email_outbox_batch_size: auth_opts.email_outbox.batch_size,
        email_outbox_max_attempts: auth_opts.email_outbox.max_attempts,
        email_outbox_backoff_base_seconds: auth_opts.email_outbox.backoff_base_seconds,
        email_outbox_backoff_max_seconds: auth_opts.email_outbox.backoff_max_seconds,
        email_outbox_retention_seconds: auth_opts.email_outbox.retention_seconds,
    }))
}
