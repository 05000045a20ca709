//! # innocent
//!
//! Account backend for the item4.net "innocent" website. It serves a REST
//! authentication surface under `/auth/` and the current-user endpoints
//! under `/users/`.
//!
//! ## Accounts
//!
//! An account is identified by its e-mail address, normalized to trimmed
//! lowercase. Registration creates an unverified primary address and e-mails
//! a confirmation link. Login is refused until the address is verified.
//!
//! ## Credentials
//!
//! Passwords are hashed with Argon2id. API tokens and confirmation keys are
//! random and only their SHA-256 hashes are persisted. Password reset tokens
//! are stateless HMACs keyed by `--secret-key`.
//!
//! ## Storage
//!
//! With `--dsn` the service uses Postgres (`sql/schema.sql`). Without it,
//! everything lives in process memory, which suits development and tests.
//! Outgoing e-mail always goes through the store's outbox.

pub mod api;
pub mod cli;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
