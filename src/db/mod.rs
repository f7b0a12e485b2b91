pub mod models;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use models::{Conversation, MessageRecord};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};

use crate::error::WorkflowError;

/// Local session database: settings and chat history.
pub struct Database {
    conn: Mutex<Connection>,
}

fn conversation_from_row(row: &Row<'_>) -> Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl Database {
    pub fn new(data_dir: &Path) -> std::result::Result<Self, WorkflowError> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("cora.db"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn migrate(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
    }

    // ── Conversations ──

    pub fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let conn = self.conn();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO conversations (id, title) VALUES (?1, ?2)",
            params![id, title],
        )?;
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
            params![id],
            conversation_from_row,
        )
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.conn()
            .query_row(
                "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                conversation_from_row,
            )
            .optional()
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at FROM conversations ORDER BY updated_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map([], conversation_from_row)?;
        rows.collect()
    }

    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Messages ──

    pub fn add_message(&self, conversation_id: &str, role: &str, content: &str) -> Result<MessageRecord> {
        let conn = self.conn();
        let id = uuid::Uuid::new_v4().to_string();
        // seq keeps insertion order stable when timestamps tie
        conn.execute(
            "INSERT INTO messages (id, conversation_id, seq, role, content)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?2), ?3, ?4)",
            params![id, conversation_id, role, content],
        )?;
        conn.execute(
            "UPDATE conversations SET updated_at = datetime('now') WHERE id = ?1",
            params![conversation_id],
        )?;
        conn.query_row(
            "SELECT id, conversation_id, role, content, created_at FROM messages WHERE id = ?1",
            params![id],
            message_from_row,
        )
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], message_from_row)?;
        rows.collect()
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_keep_insertion_order() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("Enrollment questions").unwrap();
        db.add_message(&conv.id, "user", "When?").unwrap();
        db.add_message(&conv.id, "assistant", "June 3.").unwrap();
        db.add_message(&conv.id, "user", "Thanks").unwrap();

        let contents: Vec<String> = db
            .get_messages(&conv.id)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["When?", "June 3.", "Thanks"]);
    }

    #[test]
    fn test_rejects_unknown_role() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("c").unwrap();
        assert!(db.add_message(&conv.id, "system", "nope").is_err());
    }

    #[test]
    fn test_delete_conversation_cascades() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("c").unwrap();
        db.add_message(&conv.id, "user", "hi").unwrap();
        db.delete_conversation(&conv.id).unwrap();
        assert!(db.get_messages(&conv.id).unwrap().is_empty());
        assert!(db.list_conversations().unwrap().is_empty());
    }

    #[test]
    fn test_get_conversation() {
        let db = Database::open_in_memory().unwrap();
        let conv = db.create_conversation("Scholarships").unwrap();
        assert_eq!(db.get_conversation(&conv.id).unwrap().unwrap().title, "Scholarships");
        assert!(db.get_conversation("missing").unwrap().is_none());
    }

    #[test]
    fn test_settings_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::new(dir.path()).unwrap();
            assert_eq!(db.get_setting("api_base_url").unwrap(), None);
            db.set_setting("api_base_url", "https://cora.example.edu").unwrap();
        }
        let db = Database::new(dir.path()).unwrap();
        assert_eq!(
            db.get_setting("api_base_url").unwrap().as_deref(),
            Some("https://cora.example.edu")
        );
        db.delete_setting("api_base_url").unwrap();
        assert_eq!(db.get_setting("api_base_url").unwrap(), None);
    }
}
