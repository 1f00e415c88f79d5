use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use courier_shared::UserId;

use crate::chats::{format_ts, parse_ts};
use crate::database::Database;
use crate::error::Result;
use crate::models::User;

impl Database {
    /// Insert or rename a user.
    pub fn upsert_user(&self, id: &UserId, display_name: Option<&str>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
            params![id.as_str(), display_name, format_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT id, display_name, created_at FROM users WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    let id: String = row.get(0)?;
                    let display_name: Option<String> = row.get(1)?;
                    let created: String = row.get(2)?;
                    Ok(User {
                        id: UserId(id),
                        display_name,
                        created_at: parse_ts(2, &created)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Name shown in recipient lists: the display name, or the raw id.
    pub fn display_name(&self, id: &UserId) -> Result<String> {
        Ok(self
            .get_user(id)?
            .and_then(|u| u.display_name)
            .unwrap_or_else(|| id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_id() {
        let db = Database::open_in_memory().unwrap();
        let alice = UserId::from("alice");

        assert_eq!(db.display_name(&alice).unwrap(), "alice");

        db.upsert_user(&alice, Some("Alice")).unwrap();
        assert_eq!(db.display_name(&alice).unwrap(), "Alice");

        db.upsert_user(&alice, Some("Alice L.")).unwrap();
        assert_eq!(db.display_name(&alice).unwrap(), "Alice L.");
    }
}
