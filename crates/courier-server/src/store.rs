//! Async boundary between the relay and the message store.
//!
//! The delivery engine and receipt loops only see [`MessageStore`]; the
//! SQLite implementation runs every call on the blocking pool so store
//! latency never stalls the runtime.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use courier_shared::{ChatId, MessageId, MessageStatus, UserId};
use courier_store::{Chat, Database, NewMessage, StoredMessage};

use crate::error::RelayError;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message with status `sent`. The owning chat is created
    /// if it does not exist yet.
    async fn save(&self, draft: NewMessage) -> Result<StoredMessage, RelayError>;

    /// Forward-only status update. `Ok(false)` means the message was already
    /// at or past `status`.
    async fn advance_status(&self, id: MessageId, status: MessageStatus)
        -> Result<bool, RelayError>;

    /// Messages addressed to `user` still in `sent`, oldest first.
    async fn fetch_backlog(&self, user: &UserId) -> Result<Vec<StoredMessage>, RelayError>;

    async fn get_message(&self, id: MessageId) -> Result<StoredMessage, RelayError>;

    async fn get_chat(&self, id: &ChatId) -> Result<Chat, RelayError>;

    async fn find_chat(&self, a: &UserId, b: &UserId) -> Result<Option<Chat>, RelayError>;

    async fn ensure_chat(&self, a: &UserId, b: &UserId) -> Result<Chat, RelayError>;

    async fn list_chats(&self, user: &UserId) -> Result<Vec<Chat>, RelayError>;

    async fn chat_history(&self, id: &ChatId) -> Result<Vec<StoredMessage>, RelayError>;

    async fn messages_with_status(
        &self,
        chat: &ChatId,
        receiver: &UserId,
        status: MessageStatus,
    ) -> Result<Vec<StoredMessage>, RelayError>;

    /// Mark a chat blocked by `by`. `Ok(false)` if the chat does not exist.
    async fn block_chat(&self, id: &ChatId, by: &UserId) -> Result<bool, RelayError>;

    async fn display_name(&self, user: &UserId) -> Result<String, RelayError>;

    async fn set_display_name(&self, user: &UserId, name: Option<String>)
        -> Result<(), RelayError>;
}

/// [`MessageStore`] backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn with_db<T, F>(&self, op: F) -> Result<T, RelayError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> courier_store::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| RelayError::StoreUnavailable("store lock poisoned".to_string()))?;
            op(&mut guard).map_err(RelayError::from)
        })
        .await
        .map_err(|e| RelayError::Internal(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save(&self, draft: NewMessage) -> Result<StoredMessage, RelayError> {
        self.with_db(move |db| db.insert_message(&draft)).await
    }

    async fn advance_status(
        &self,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<bool, RelayError> {
        self.with_db(move |db| db.advance_status(id, status)).await
    }

    async fn fetch_backlog(&self, user: &UserId) -> Result<Vec<StoredMessage>, RelayError> {
        let user = user.clone();
        self.with_db(move |db| db.undelivered_for(&user)).await
    }

    async fn get_message(&self, id: MessageId) -> Result<StoredMessage, RelayError> {
        self.with_db(move |db| db.get_message(id)).await
    }

    async fn get_chat(&self, id: &ChatId) -> Result<Chat, RelayError> {
        let id = id.clone();
        self.with_db(move |db| db.get_chat(&id)).await
    }

    async fn find_chat(&self, a: &UserId, b: &UserId) -> Result<Option<Chat>, RelayError> {
        let (a, b) = (a.clone(), b.clone());
        self.with_db(move |db| db.find_chat_between(&a, &b)).await
    }

    async fn ensure_chat(&self, a: &UserId, b: &UserId) -> Result<Chat, RelayError> {
        let (a, b) = (a.clone(), b.clone());
        self.with_db(move |db| db.ensure_chat(&a, &b)).await
    }

    async fn list_chats(&self, user: &UserId) -> Result<Vec<Chat>, RelayError> {
        let user = user.clone();
        self.with_db(move |db| db.list_chats_for_user(&user)).await
    }

    async fn chat_history(&self, id: &ChatId) -> Result<Vec<StoredMessage>, RelayError> {
        let id = id.clone();
        self.with_db(move |db| db.messages_in_chat(&id)).await
    }

    async fn messages_with_status(
        &self,
        chat: &ChatId,
        receiver: &UserId,
        status: MessageStatus,
    ) -> Result<Vec<StoredMessage>, RelayError> {
        let (chat, receiver) = (chat.clone(), receiver.clone());
        self.with_db(move |db| db.messages_with_status(&chat, &receiver, status))
            .await
    }

    async fn block_chat(&self, id: &ChatId, by: &UserId) -> Result<bool, RelayError> {
        let (id, by) = (id.clone(), by.clone());
        self.with_db(move |db| db.block_chat(&id, &by)).await
    }

    async fn display_name(&self, user: &UserId) -> Result<String, RelayError> {
        let user = user.clone();
        self.with_db(move |db| db.display_name(&user)).await
    }

    async fn set_display_name(
        &self,
        user: &UserId,
        name: Option<String>,
    ) -> Result<(), RelayError> {
        let user = user.clone();
        self.with_db(move |db| db.upsert_user(&user, name.as_deref()))
            .await
    }
}
