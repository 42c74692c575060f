use chrono::Utc;
use conductor_core::{Error, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One input/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub input: String,
    pub response: String,
    pub source: String,
    pub created_at_ms: i64,
}

impl ConversationRecord {
    fn now(input: &str, response: &str, source: &str) -> Self {
        Self {
            input: input.to_string(),
            response: response.to_string(),
            source: source.to_string(),
            created_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Persistence for the exchanges Core processes.
pub trait ConversationStore: Send + Sync {
    fn save_conversation(&self, input: &str, response: &str, source: &str) -> Result<()>;

    /// The `n` most recent exchanges, newest first.
    fn get_last_conversations(&self, n: usize) -> Result<Vec<ConversationRecord>>;

    fn count(&self) -> Result<usize>;
}

/// SQLite-backed conversation log.
#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

fn storage_err(context: &str, e: rusqlite::Error) -> Error {
    Error::Storage(format!("{}: {}", context, e))
}

impl SqliteConversationStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create db directory: {}", e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| storage_err("Failed to open conversation db", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        debug!(path = %path.display(), "Conversation store opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| storage_err("Failed to open in-memory db", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                input TEXT NOT NULL,
                response TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'unknown',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_created ON conversations(created_at);
            ",
        )
        .map_err(|e| storage_err("Failed to initialise schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConversationStore for SqliteConversationStore {
    fn save_conversation(&self, input: &str, response: &str, source: &str) -> Result<()> {
        let record = ConversationRecord::now(input, response, source);
        let conn = self.lock();
        conn.execute(
            "INSERT INTO conversations (input, response, source, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![record.input, record.response, record.source, record.created_at_ms],
        )
        .map_err(|e| storage_err("Failed to save conversation", e))?;
        Ok(())
    }

    fn get_last_conversations(&self, n: usize) -> Result<Vec<ConversationRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT input, response, source, created_at FROM conversations
                 ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| storage_err("Failed to prepare query", e))?;
        let rows = stmt
            .query_map(params![n as i64], |row| {
                Ok(ConversationRecord {
                    input: row.get(0)?,
                    response: row.get(1)?,
                    source: row.get(2)?,
                    created_at_ms: row.get(3)?,
                })
            })
            .map_err(|e| storage_err("Failed to query conversations", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("Failed to read conversation row", e))
    }

    fn count(&self) -> Result<usize> {
        let conn = self.lock();
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .map_err(|e| storage_err("Failed to count conversations", e))?;
        Ok(total as usize)
    }
}

/// Bounded in-process conversation log; the oldest exchange is dropped at capacity.
pub struct InMemoryConversationStore {
    records: Mutex<VecDeque<ConversationRecord>>,
    capacity: usize,
}

impl InMemoryConversationStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn save_conversation(&self, input: &str, response: &str, source: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push_back(ConversationRecord::now(input, response, source));
        while records.len() > self.capacity {
            records.pop_front();
        }
        Ok(())
    }

    fn get_last_conversations(&self, n: usize) -> Result<Vec<ConversationRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.iter().rev().take(n).cloned().collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.records.lock().unwrap_or_else(|e| e.into_inner()).len())
    }
}
