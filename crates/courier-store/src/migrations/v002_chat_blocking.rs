use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE chats ADD COLUMN is_blocked INTEGER NOT NULL DEFAULT 0;   -- boolean 0/1
ALTER TABLE chats ADD COLUMN blocked_by TEXT;                         -- user who blocked
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
