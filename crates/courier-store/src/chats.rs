use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::{ChatId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Chat;

const CHAT_COLUMNS: &str =
    "id, user_low, user_high, last_message, is_blocked, blocked_by, created_at, last_updated";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the chat between `a` and `b`, creating an empty one if needed.
    pub fn ensure_chat(&self, a: &UserId, b: &UserId) -> Result<Chat> {
        let id = ChatId::for_pair(a, b);
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let now = format_ts(Utc::now());

        self.conn().execute(
            "INSERT OR IGNORE INTO chats (id, user_low, user_high, created_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id.as_str(), low.as_str(), high.as_str(), now],
        )?;

        self.get_chat(&id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single chat by id.
    pub fn get_chat(&self, id: &ChatId) -> Result<Chat> {
        self.conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id.as_str()],
                row_to_chat,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Fetch the chat between two users, if one exists.
    pub fn find_chat_between(&self, a: &UserId, b: &UserId) -> Result<Option<Chat>> {
        let id = ChatId::for_pair(a, b);
        let chat = self
            .conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id.as_str()],
                row_to_chat,
            )
            .optional()?;
        Ok(chat)
    }

    /// List every chat `user` takes part in, most recently updated first.
    pub fn list_chats_for_user(&self, user: &UserId) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHAT_COLUMNS}
             FROM chats
             WHERE user_low = ?1 OR user_high = ?1
             ORDER BY last_updated DESC"
        ))?;

        let rows = stmt.query_map(params![user.as_str()], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Mark a chat as blocked by `by`. Returns `false` if the chat does not
    /// exist.
    pub fn block_chat(&self, id: &ChatId, by: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chats SET is_blocked = 1, blocked_by = ?2 WHERE id = ?1",
            params![id.as_str(), by.as_str()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Timestamps are written with a fixed microsecond precision.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Map a `rusqlite::Row` to a [`Chat`].
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let id: String = row.get(0)?;
    let user_low: String = row.get(1)?;
    let user_high: String = row.get(2)?;
    let last_message: Option<String> = row.get(3)?;
    let is_blocked: bool = row.get(4)?;
    let blocked_by: Option<String> = row.get(5)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;

    Ok(Chat {
        id: ChatId(id),
        user_low: UserId(user_low),
        user_high: UserId(user_high),
        last_message,
        is_blocked,
        blocked_by: blocked_by.map(UserId),
        created_at: parse_ts(6, &created_str)?,
        last_updated: parse_ts(7, &updated_str)?,
    })
}
