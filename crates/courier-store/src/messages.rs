use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use courier_shared::{ChatId, MessageId, MessageStatus, UserId};

use crate::chats::{format_ts, parse_ts};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{NewMessage, StoredMessage};

const MESSAGE_COLUMNS: &str =
    "seq, id, chat_id, sender, receiver, body, attachments, status, created_at";

impl Database {
    /// Persist a new message with status `sent`.
    ///
    /// The owning chat is created if needed and its summary (last message,
    /// last update) is refreshed in the same transaction, so readers see
    /// either the whole submission or nothing. `created_at` is assigned here
    /// and is strictly increasing within the chat.
    pub fn insert_message(&mut self, draft: &NewMessage) -> Result<StoredMessage> {
        let chat_id = ChatId::for_pair(&draft.sender, &draft.receiver);
        let (low, high) = if draft.sender <= draft.receiver {
            (&draft.sender, &draft.receiver)
        } else {
            (&draft.receiver, &draft.sender)
        };
        let attachments = serde_json::to_string(&draft.attachments)?;
        let now = truncate_to_micros(Utc::now());

        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO chats (id, user_low, user_high, created_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![chat_id.as_str(), low.as_str(), high.as_str(), format_ts(now)],
        )?;

        let last_updated: String = tx.query_row(
            "SELECT last_updated FROM chats WHERE id = ?1",
            params![chat_id.as_str()],
            |row| row.get(0),
        )?;
        let last_updated = parse_ts(0, &last_updated)?;
        let created_at = if now > last_updated {
            now
        } else {
            last_updated + Duration::microseconds(1)
        };

        tx.execute(
            "INSERT INTO messages (id, chat_id, sender, receiver, body, attachments, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                draft.id.to_string(),
                chat_id.as_str(),
                draft.sender.as_str(),
                draft.receiver.as_str(),
                draft.body,
                attachments,
                MessageStatus::Sent.rank(),
                format_ts(created_at),
            ],
        )?;
        let seq = tx.last_insert_rowid();

        tx.execute(
            "UPDATE chats SET last_message = ?2, last_updated = ?3 WHERE id = ?1",
            params![chat_id.as_str(), draft.body, format_ts(created_at)],
        )?;

        tx.commit()?;

        tracing::debug!(id = %draft.id, chat = %chat_id, seq, "message stored");

        Ok(StoredMessage {
            id: draft.id,
            chat_id,
            sender: draft.sender.clone(),
            receiver: draft.receiver.clone(),
            body: draft.body.clone(),
            attachments: draft.attachments.clone(),
            status: MessageStatus::Sent,
            created_at,
            seq,
        })
    }

    /// Move a message forward to `status`.
    ///
    /// Returns `true` if the status changed, `false` if the message was
    /// already at or past `status` (re-applying or regressing is a no-op).
    /// The compare-and-set happens in a single statement, so concurrent
    /// callers racing on the same transition see exactly one `true`.
    pub fn advance_status(&self, id: MessageId, status: MessageStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
            params![id.to_string(), status.rank()],
        )?;
        if affected > 0 {
            return Ok(true);
        }

        // Distinguish "already there" from "no such message".
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound)
        }
    }

    pub fn get_message(&self, id: MessageId) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Messages addressed to `receiver` that are still `sent`, in submission
    /// order.
    pub fn undelivered_for(&self, receiver: &UserId) -> Result<Vec<StoredMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE receiver = ?1 AND status = ?2
                 ORDER BY seq ASC"
            ),
            params![receiver.as_str(), MessageStatus::Sent.rank()],
        )
    }

    /// Full history of a chat in submission order.
    pub fn messages_in_chat(&self, chat_id: &ChatId) -> Result<Vec<StoredMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1
                 ORDER BY seq ASC"
            ),
            params![chat_id.as_str()],
        )
    }

    /// Messages in `chat_id` addressed to `receiver` with exactly `status`.
    pub fn messages_with_status(
        &self,
        chat_id: &ChatId,
        receiver: &UserId,
        status: MessageStatus,
    ) -> Result<Vec<StoredMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 AND receiver = ?2 AND status = ?3
                 ORDER BY seq ASC"
            ),
            params![chat_id.as_str(), receiver.as_str(), status.rank()],
        )
    }

    fn query_messages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let extra_nanos = ts.timestamp_subsec_nanos() % 1_000;
    ts - Duration::nanoseconds(i64::from(extra_nanos))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let chat_id: String = row.get(2)?;
    let sender: String = row.get(3)?;
    let receiver: String = row.get(4)?;
    let body: String = row.get(5)?;
    let attachments_json: String = row.get(6)?;
    let status_rank: u8 = row.get(7)?;
    let ts_str: String = row.get(8)?;

    let id = id_str.parse::<MessageId>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let attachments: Vec<String> = serde_json::from_str(&attachments_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let status = MessageStatus::from_rank(status_rank).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Integer,
            Box::new(StoreError::InvalidStatus(status_rank)),
        )
    })?;

    Ok(StoredMessage {
        id,
        chat_id: ChatId(chat_id),
        sender: UserId(sender),
        receiver: UserId(receiver),
        body,
        attachments,
        status,
        created_at: parse_ts(8, &ts_str)?,
        seq,
    })
}
