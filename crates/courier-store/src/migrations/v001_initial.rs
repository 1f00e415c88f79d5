//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `users`, `chats` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (display names for recipient lists)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- opaque user id
    display_name TEXT,
    created_at   TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Chats: one row per unordered pair of participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id           TEXT PRIMARY KEY NOT NULL,   -- ChatId::for_pair
    user_low     TEXT NOT NULL,               -- lexicographically smaller id
    user_high    TEXT NOT NULL,
    last_message TEXT,
    created_at   TEXT NOT NULL,
    last_updated TEXT NOT NULL,

    UNIQUE (user_low, user_high)
);

CREATE INDEX IF NOT EXISTS idx_chats_user_low  ON chats(user_low);
CREATE INDEX IF NOT EXISTS idx_chats_user_high ON chats(user_high);

-- ----------------------------------------------------------------
-- Messages. `seq` gives submission order; `status` is the rank
-- 0 = sent, 1 = delivered, 2 = read and only ever increases.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,         -- UUID v4
    chat_id     TEXT NOT NULL,                -- FK -> chats(id)
    sender      TEXT NOT NULL,
    receiver    TEXT NOT NULL,
    body        TEXT NOT NULL,
    attachments TEXT NOT NULL DEFAULT '[]',   -- JSON array of references
    status      INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_seq
    ON messages(chat_id, seq);

CREATE INDEX IF NOT EXISTS idx_messages_backlog
    ON messages(receiver, status, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
