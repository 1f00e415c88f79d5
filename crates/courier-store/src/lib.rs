//! # courier-store
//!
//! SQLite storage for the courier relay: chats between two users, the
//! messages exchanged in them, and the monotonic delivery status of each
//! message.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every operation the
//! relay needs. Callers in async code are expected to serialize access (the
//! relay wraps it in a mutex and runs calls on the blocking pool).

pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
