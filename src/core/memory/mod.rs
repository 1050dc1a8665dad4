mod conversation;
mod knowledge;
mod schedule;
pub mod types;
mod workflow;

use anyhow::Result;
use rusqlite::{Connection, ffi::sqlite3_auto_extension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::config::DB_FILE;

/// The single SQLite store behind conversations, schedules, the knowledge base
/// and workflow checkpoints.
pub struct MemorySystem {
    db: Arc<Mutex<Connection>>,
    data_dir: PathBuf,
    vector_dims: usize,
}

impl MemorySystem {
    pub async fn new<P: AsRef<Path>>(data_dir: P, vector_dims: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).await?;
        }

        register_sqlite_vec();

        let db_path = data_dir.join(DB_FILE);
        let db = Connection::open(&db_path)?;
        init_schema(&db, vector_dims)?;
        info!("Memory system opened at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            data_dir,
            vector_dims,
        })
    }

    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn vector_dims(&self) -> usize {
        self.vector_dims
    }
}

/// Load the sqlite-vec extension into every connection opened afterwards.
fn register_sqlite_vec() {
    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut std::os::raw::c_char,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> std::os::raw::c_int,
        >(sqlite_vec::sqlite3_vec_init as *const ())));
    }
}

fn init_schema(db: &Connection, vector_dims: usize) -> Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            tool_invocations TEXT NOT NULL DEFAULT '[]',
            created_at_ms INTEGER NOT NULL
        )",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            callback TEXT NOT NULL,
            payload TEXT NOT NULL,
            kind TEXT NOT NULL,
            cron TEXT,
            next_fire_ms INTEGER NOT NULL,
            created_at_ms INTEGER NOT NULL
        )",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_next_fire ON schedules(next_fire_ms)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL UNIQUE,
            content TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        &format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vss_documents USING vec0(
                embedding float[{}]
            )",
            vector_dims
        ),
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS workflow_runs (
            id TEXT PRIMARY KEY,
            input TEXT NOT NULL,
            status TEXT NOT NULL,
            retryable INTEGER NOT NULL DEFAULT 1,
            error TEXT,
            created_at_ms INTEGER NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS workflow_steps (
            run_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (run_id, name)
        )",
        [],
    )?;

    Ok(())
}

/// Create a MemorySystem in a throwaway directory for tests. The directory is
/// removed when the returned `TempDir` drops.
#[cfg(test)]
pub async fn test_memory_system(vector_dims: usize) -> (MemorySystem, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create test data dir");
    let memory = MemorySystem::new(dir.path(), vector_dims)
        .await
        .expect("open test memory system");
    (memory, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_created_and_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        {
            let memory = MemorySystem::new(dir.path(), 3).await.unwrap();
            assert_eq!(memory.vector_dims(), 3);
        }
        let memory = MemorySystem::new(dir.path(), 3).await.unwrap();
        let db = memory.get_db();
        let db = db.lock().await;
        let tables: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name IN
                 ('messages', 'schedules', 'documents', 'vss_documents', 'workflow_runs', 'workflow_steps')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
        assert!(dir.path().join(DB_FILE).exists());
    }

    #[tokio::test]
    async fn test_store_directory_is_removed_on_drop() {
        let (memory, dir) = test_memory_system(3).await;
        let path = memory.data_dir().to_path_buf();
        assert!(path.join(DB_FILE).exists());
        drop(memory);
        drop(dir);
        assert!(!path.exists());
    }
}
