//! # courier-shared
//!
//! Types shared by the courier store and relay server: user, chat and
//! message identifiers, the monotonic delivery status, the JSON wire frames
//! exchanged over the WebSocket channel, and signed session tokens.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod token;
pub mod types;

pub use error::{ProtocolError, TokenError};
pub use types::{ChatId, MessageId, MessageStatus, UserId};
