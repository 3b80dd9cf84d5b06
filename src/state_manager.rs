// src/state_manager.rs

use crate::models::DownloadTask;
use rusqlite::params;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;
use tracing::{debug, error};

const DB_FILE: &str = "index.sqlite3";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable id -> task mapping for every task that has not finished yet.
///
/// Keys are the task id as a fixed-width big-endian integer, so iteration
/// order is id order. The database is opened for each operation and closed
/// afterwards; one lock serialises all access.
pub struct TaskStore {
    db_path: PathBuf,
    lock: Mutex<()>,
}

fn task_key(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

impl TaskStore {
    /// Creates the store directory if needed and makes sure the table exists.
    pub async fn open(dir: &Path) -> Result<Self, StateError> {
        tokio::fs::create_dir_all(dir).await?;
        let store = Self {
            db_path: dir.join(DB_FILE),
            lock: Mutex::new(()),
        };
        let _guard = store.lock.lock().await;
        let conn = store.connect().await?;
        conn.close().await?;
        drop(_guard);
        debug!(path = %store.db_path.display(), "task store ready");
        Ok(store)
    }

    async fn connect(&self) -> Result<Connection, StateError> {
        let conn = Connection::open(&self.db_path).await?;
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS download_tasks (
                    id          BLOB PRIMARY KEY,
                    task_data   TEXT NOT NULL
                ) WITHOUT ROWID",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(conn)
    }

    /// Inserts or replaces the record for `task.id`.
    pub async fn put(&self, task: &DownloadTask) -> Result<(), StateError> {
        let task_data = serde_json::to_string(task)?;
        let key = task_key(task.id);

        let _guard = self.lock.lock().await;
        let conn = self.connect().await?;
        conn.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO download_tasks (id, task_data) VALUES (?1, ?2)",
                params![key, task_data],
            )?;
            Ok(())
        })
        .await?;
        conn.close().await?;
        Ok(())
    }

    pub async fn delete(&self, task_id: u64) -> Result<(), StateError> {
        let key = task_key(task_id);

        let _guard = self.lock.lock().await;
        let conn = self.connect().await?;
        conn.call(move |conn| {
            conn.execute("DELETE FROM download_tasks WHERE id = ?1", params![key])?;
            Ok(())
        })
        .await?;
        conn.close().await?;
        Ok(())
    }

    /// Loads every stored task in ascending id order.
    /// Records that no longer deserialize are logged and skipped.
    pub async fn list_all(&self) -> Result<Vec<DownloadTask>, StateError> {
        let _guard = self.lock.lock().await;
        let conn = self.connect().await?;
        let rows = conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT task_data FROM download_tasks ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        conn.close().await?;

        let tasks = rows
            .into_iter()
            .filter_map(|raw| match serde_json::from_str::<DownloadTask>(&raw) {
                Ok(task) => Some(task),
                Err(e) => {
                    error!(err = %e, record = %raw, "skipping unreadable task record");
                    None
                }
            })
            .collect();
        Ok(tasks)
    }
}
