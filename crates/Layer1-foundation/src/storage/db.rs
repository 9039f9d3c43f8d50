//! SQLite Storage for finished task records
//!
//! Only tasks submitted with `persist: true` are written here, once, when they
//! reach their final state.
//!
//! ## Migration System
//!
//! Database schema is versioned. Migrations run automatically on startup.
//! - Version 1: Initial schema (task_records)

use crate::{Error, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Current schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Final record of one task's life cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Final state name, e.g. `SUCCESSFUL`, `FAILED_TEST`
    pub state: String,
    pub start: DateTime<Local>,
    pub end: Option<DateTime<Local>>,
    pub retries: u8,
    /// Host that last executed the task
    pub exec_host: Option<String>,
    /// Classified failure of the last run, if any
    pub failure: Option<String>,
    pub finished_at: DateTime<Local>,
}

/// Storage service for finished-task records
///
/// Clones share one connection.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Storage(format!("Failed to create data directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        storage.initialize_schema()?;
        storage.run_migrations()?;

        info!("Task records stored in {}", path.display());
        Ok(storage)
    }

    /// Create an in-memory storage (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        storage.initialize_schema()?;
        storage.run_migrations()?;

        Ok(storage)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    /// Get current schema version from database
    pub fn get_schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;

        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Storage(format!("Failed to get schema version: {}", e)))
    }

    /// Initialize database schema (base tables)
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Finished tasks
            CREATE TABLE IF NOT EXISTS task_records (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT,
                retries INTEGER NOT NULL DEFAULT 0,
                exec_host TEXT,
                failure TEXT,
                finished_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_records_finished
                ON task_records(finished_at DESC);

            -- Insert initial schema version if not exists
            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Run all pending migrations
    fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version()?;

        if current_version >= CURRENT_SCHEMA_VERSION {
            debug!(
                "Database schema is up to date (version {})",
                current_version
            );
            return Ok(());
        }

        warn!(
            "Database schema version {} is older than {}, no migrations registered",
            current_version, CURRENT_SCHEMA_VERSION
        );
        Ok(())
    }

    // ========================================================================
    // Task Record Operations
    // ========================================================================

    /// Insert or replace the record for a task
    pub fn save_record(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO task_records
                (id, state, start_at, end_at, retries, exec_host, failure, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.id,
                record.state,
                record.start.to_rfc3339(),
                record.end.map(|e| e.to_rfc3339()),
                record.retries,
                record.exec_host,
                record.failure,
                record.finished_at.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Storage(format!("Failed to save task record: {}", e)))?;

        Ok(())
    }

    /// Get a record by task ID
    pub fn get_record(&self, id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock()?;

        conn.query_row(
            r#"
            SELECT id, state, start_at, end_at, retries, exec_host, failure, finished_at
            FROM task_records WHERE id = ?1
            "#,
            params![id],
            row_to_record,
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to get task record: {}", e)))
    }

    /// Most recently finished records first
    pub fn recent_records(&self, limit: u32) -> Result<Vec<TaskRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, state, start_at, end_at, retries, exec_host, failure, finished_at
                FROM task_records ORDER BY finished_at DESC LIMIT ?1
                "#,
            )
            .map_err(|e| Error::Storage(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![limit], row_to_record)
            .map_err(|e| Error::Storage(format!("Failed to query task records: {}", e)))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Storage(format!("Failed to read task records: {}", e)))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let start: String = row.get(2)?;
    let end: Option<String> = row.get(3)?;
    let finished: String = row.get(7)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        state: row.get(1)?,
        start: parse_time(2, &start)?,
        end: end.map(|e| parse_time(3, &e)).transpose()?,
        retries: row.get(4)?,
        exec_host: row.get(5)?,
        failure: row.get(6)?,
        finished_at: parse_time(7, &finished)?,
    })
}

fn parse_time(column: usize, value: &str) -> rusqlite::Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(id: &str, finished_offset: i64) -> TaskRecord {
        let start = Local.timestamp_opt(1_700_000_000, 0).unwrap();
        TaskRecord {
            id: id.to_string(),
            state: "FAILED_TEST".to_string(),
            start,
            end: None,
            retries: 2,
            exec_host: Some("host.example.com".to_string()),
            failure: Some("command exited with status 1".to_string()),
            finished_at: start + Duration::seconds(finished_offset),
        }
    }

    #[test]
    fn test_schema_version() {
        let storage = Storage::in_memory().unwrap();
        assert_eq!(storage.get_schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_save_and_get_record() {
        let storage = Storage::in_memory().unwrap();
        let rec = record("task-1", 10);
        storage.save_record(&rec).unwrap();

        let loaded = storage.get_record("task-1").unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(storage.get_record("missing").unwrap().is_none());
    }

    #[test]
    fn test_recent_records_order() {
        let storage = Storage::in_memory().unwrap();
        storage.save_record(&record("older", 10)).unwrap();
        storage.save_record(&record("newer", 20)).unwrap();

        let recent = storage.recent_records(10).unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("records.db");
        {
            let storage = Storage::open(&path).unwrap();
            storage.save_record(&record("persisted", 1)).unwrap();
        }
        let reopened = Storage::open(&path).unwrap();
        assert!(reopened.get_record("persisted").unwrap().is_some());
    }
}
