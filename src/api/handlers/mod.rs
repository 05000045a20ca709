//! API handlers.
//!
//! Route handlers for the auth, users, and health surfaces plus the shared
//! payload parsing in [`forms`].

pub mod auth;
pub mod forms;
pub mod health;
pub mod root;
pub mod users;
