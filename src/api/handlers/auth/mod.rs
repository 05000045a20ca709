//! Auth handlers and supporting modules.
//!
//! This module covers the account lifecycle: registration with e-mail
//! verification, token login, logout, password reset by e-mail, and password
//! change.
//!
//! ## Tokens
//!
//! Login issues a random 40-character hex key. Only its SHA-256 hash is
//! stored. Clients present the key as `Authorization: Token <key>` (or
//! `Bearer`), or through the `innocent_session` cookie set on login.
//!
//! ## Confirmation keys
//!
//! Registration stores the hash of a random URL-safe key and queues an e-mail
//! with the link `<site_url>/auth/confirm/<key>/` in the same unit of work.
//! A key is consumed on confirmation together with any other pending key for
//! the same address.
//!
//! ## Password reset
//!
//! Reset tokens are stateless. They are an HMAC over the account state that a
//! reset or login changes, so a token stops working once either happens.

pub(crate) mod confirm;
pub(crate) mod login;
mod messages;
pub(crate) mod password;
mod passwords;
pub(crate) mod register;
mod reset_token;
pub(crate) mod session;
mod state;
pub(crate) mod types;
pub(crate) mod utils;

pub use session::{AuthenticatedUser, SESSION_COOKIE_NAME};
pub use state::{AuthConfig, AuthState};

const PASSWORD_MISMATCH: &str = "The two password fields didn't match.";
const VERIFICATION_SENT: &str = "Verification e-mail sent.";

#[cfg(test)]
mod tests;
