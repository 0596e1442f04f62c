use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use super::{keyword_rows, ConfigBackend, KeywordRow};
use crate::config::{BackendKind, MonitorConfig};
use crate::lead::Lead;

/// Thread-safe SQLite store mirroring the remote tables, for self-hosted runs.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Lead store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS monitored_chats (
                username TEXT PRIMARY KEY COLLATE NOCASE,
                is_active INTEGER NOT NULL DEFAULT 1,
                leads_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS keywords (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                word TEXT NOT NULL,
                category TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_keywords_word
                ON keywords(category, word);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_username TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                message_link TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_leads_message
                ON leads(chat_username, message_id);
            ",
        )
        .context("Failed to run lead store migrations")?;
        Ok(())
    }

    pub async fn add_chat(&self, username: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO monitored_chats (username) VALUES (?1)
             ON CONFLICT(username) DO UPDATE SET is_active = 1",
            rusqlite::params![username.trim_start_matches('@')],
        )
        .context("Failed to add chat")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn set_chat_active(&self, username: &str, active: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE monitored_chats SET is_active = ?1 WHERE username = ?2",
            rusqlite::params![active, username],
        )
        .context("Failed to update chat")?;
        Ok(())
    }

    pub async fn add_keyword(&self, word: &str, category: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO keywords (word, category) VALUES (?1, ?2)",
            rusqlite::params![word, category],
        )
        .context("Failed to add keyword")?;
        Ok(())
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )
        .context("Failed to store setting")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn leads_count(&self, username: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn
            .query_row(
                "SELECT leads_count FROM monitored_chats WHERE username = ?1",
                rusqlite::params![username],
                |row| row.get(0),
            )
            .context("Failed to read leads count")?;
        Ok(count)
    }

    /// Populate an empty database from the config file, so a fresh sqlite
    /// deployment starts with the same chats and keywords as a static one.
    pub async fn seed_if_empty(&self, monitor: &MonitorConfig) -> Result<()> {
        let (chats, keywords): (i64, i64) = {
            let conn = self.conn.lock().await;
            let chats = conn.query_row("SELECT count(*) FROM monitored_chats", [], |row| {
                row.get(0)
            })?;
            let keywords =
                conn.query_row("SELECT count(*) FROM keywords", [], |row| row.get(0))?;
            (chats, keywords)
        };

        if chats == 0 {
            for chat in &monitor.chats {
                self.add_chat(chat).await?;
            }
            info!("Seeded {} chats from config", monitor.chats.len());
        }

        if keywords == 0 {
            let rows = keyword_rows(&monitor.keywords);
            for row in &rows {
                self.add_keyword(&row.word, &row.category).await?;
            }
            self.set_setting(
                "min_message_length",
                &monitor.min_message_length.to_string(),
            )
            .await?;
            info!("Seeded {} keywords from config", rows.len());
        }

        Ok(())
    }
}

#[async_trait]
impl ConfigBackend for SqliteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn load_chats(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT username FROM monitored_chats WHERE is_active = 1 ORDER BY username")
            .context("Failed to prepare chats query")?;
        let chats = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query chats")?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("Failed to collect chats")?;
        Ok(chats)
    }

    async fn load_keywords(&self) -> Result<Vec<KeywordRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT word, category FROM keywords WHERE is_active = 1 ORDER BY id")
            .context("Failed to prepare keywords query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(KeywordRow {
                    word: row.get(0)?,
                    category: row.get(1)?,
                })
            })
            .context("Failed to query keywords")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect keywords")?;
        Ok(rows)
    }

    async fn load_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .context("Failed to prepare settings query")?;
        let settings = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query settings")?
            .collect::<rusqlite::Result<HashMap<String, String>>>()
            .context("Failed to collect settings")?;
        Ok(settings)
    }

    async fn is_duplicate(&self, chat: &str, message_id: i32) -> Result<bool> {
        let conn = self.conn.lock().await;
        let exists: bool = conn
            .query_row(
                "SELECT count(*) > 0 FROM leads WHERE chat_username = ?1 AND message_id = ?2",
                rusqlite::params![chat, message_id],
                |row| row.get(0),
            )
            .context("Failed to check for duplicate lead")?;
        Ok(exists)
    }

    async fn record_lead(&self, lead: &Lead) -> Result<()> {
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO leads (chat_username, message_id, text, message_link)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    lead.chat_key(),
                    lead.message_id,
                    lead.text,
                    lead.message_link
                ],
            )
            .context("Failed to record lead")?;

        if inserted > 0 {
            conn.execute(
                "UPDATE monitored_chats SET leads_count = leads_count + 1 WHERE username = ?1",
                rusqlite::params![lead.chat_key()],
            )
            .context("Failed to increment chat leads")?;
        }
        Ok(())
    }
}
