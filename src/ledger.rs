// src/ledger.rs

use crate::models::{ContentState, ContentStatus, DownloadTarget};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Persistent bookkeeping for one content entry of the HTTP downloader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentRecord {
    /// Download directory; the key of the entry.
    pub path: PathBuf,
    pub target: DownloadTarget,
    pub state: ContentState,
    pub downloaded_bytes: u64,
    /// 0 until the size is known.
    pub total_bytes: u64,
}

impl ContentRecord {
    pub fn new(path: impl Into<PathBuf>, target: DownloadTarget) -> Self {
        Self {
            path: path.into(),
            target,
            state: ContentState::Pending,
            downloaded_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Where the media file is written.
    pub fn media_path(&self) -> PathBuf {
        self.path.join(self.target.media_file_name())
    }

    /// Stays below 100 until the entry is completed.
    pub fn percentage(&self) -> u8 {
        match self.state {
            ContentState::Completed => 100,
            _ if self.total_bytes == 0 => 0,
            _ => (self.downloaded_bytes.saturating_mul(100) / self.total_bytes).min(99) as u8,
        }
    }

    pub fn status(&self) -> ContentStatus {
        ContentStatus::new(&self.path, self.state, self.percentage())
            .with_content(self.target.clone())
    }
}

/// Stores content records in SQLite so an interrupted run can be resumed.
pub struct ContentLedger {
    conn: Connection,
}

impl ContentLedger {
    /// Opens (or creates) the database file and its table.
    pub async fn open(db_path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(db_path).await?;
        let ledger = Self { conn };
        ledger.setup().await?;
        Ok(ledger)
    }

    async fn setup(&self) -> Result<(), LedgerError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS content (
                        path            TEXT PRIMARY KEY,
                        record          TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the record keyed by its path.
    pub async fn save(&self, record: &ContentRecord) -> Result<(), LedgerError> {
        let data = serde_json::to_string(record)?;
        let key = path_key(&record.path);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO content (path, record) VALUES (?1, ?2)",
                    params![key, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<ContentRecord>, LedgerError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record FROM content ORDER BY path")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(LedgerError::from))
            .collect()
    }

    pub async fn delete(&self, path: &Path) -> Result<(), LedgerError> {
        let key = path_key(path);
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM content WHERE path = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
