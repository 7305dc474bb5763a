//! `SQLite`-backed implementation of [`WatermarkStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use shopsync_types::dataset::DatasetKind;
use shopsync_types::state::{PipelineId, RunStats, RunStatus};
use shopsync_types::watermark::Watermark;

use crate::backend::WatermarkStore;
use crate::error::{self, StateError};

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS watermarks (
    pipeline TEXT NOT NULL,
    dataset TEXT NOT NULL,
    watermark TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, dataset)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    dataset TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_read INTEGER DEFAULT 0,
    records_written INTEGER DEFAULT 0,
    records_skipped INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_pipeline ON sync_runs (pipeline, dataset);
";

/// `SQLite`-backed watermark storage.
///
/// Create with [`SqliteWatermarkStore::open`] for file-backed persistence
/// or [`SqliteWatermarkStore::in_memory`] for tests.
pub struct SqliteWatermarkStore {
    conn: Mutex<Connection>,
}

impl SqliteWatermarkStore {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the database can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn read_watermark(
        conn: &Connection,
        pipeline: &PipelineId,
        dataset: DatasetKind,
    ) -> error::Result<Watermark> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT watermark FROM watermarks WHERE pipeline = ?1 AND dataset = ?2",
                rusqlite::params![pipeline.as_str(), dataset.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| StateError::Corrupt {
                dataset: dataset.to_string(),
                source,
            }),
            None => Ok(Watermark::Beginning),
        }
    }

    #[cfg(test)]
    fn get_run_row(&self, run_id: i64) -> error::Result<(String, i64, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT status, records_read, records_skipped, finished_at, error_message \
             FROM sync_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?)
    }
}

fn same_kind(a: &Watermark, b: &Watermark) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

impl WatermarkStore for SqliteWatermarkStore {
    fn get(&self, pipeline: &PipelineId, dataset: DatasetKind) -> error::Result<Watermark> {
        let conn = self.lock_conn()?;
        Self::read_watermark(&conn, pipeline, dataset)
    }

    fn commit(
        &self,
        pipeline: &PipelineId,
        dataset: DatasetKind,
        watermark: &Watermark,
    ) -> error::Result<Watermark> {
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;

        let stored = Self::read_watermark(&tx, pipeline, dataset)?;
        if watermark.is_beginning() {
            return Ok(stored);
        }
        if !stored.is_beginning() && !same_kind(&stored, watermark) {
            return Err(StateError::KindChanged {
                dataset: dataset.to_string(),
                stored,
                requested: watermark.clone(),
            });
        }
        if *watermark <= stored {
            return Ok(stored);
        }

        let encoded = serde_json::to_string(watermark).map_err(|source| StateError::Corrupt {
            dataset: dataset.to_string(),
            source,
        })?;
        tx.execute(
            "INSERT INTO watermarks (pipeline, dataset, watermark, updated_at) \
             VALUES (?1, ?2, ?3, datetime('now')) \
             ON CONFLICT(pipeline, dataset) \
             DO UPDATE SET watermark = ?3, updated_at = datetime('now')",
            rusqlite::params![pipeline.as_str(), dataset.as_str(), encoded],
        )?;
        tx.commit()?;
        Ok(watermark.clone())
    }

    fn start_run(&self, pipeline: &PipelineId, dataset: DatasetKind) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sync_runs (pipeline, dataset, status) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                pipeline.as_str(),
                dataset.as_str(),
                RunStatus::Running.as_str()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sync_runs SET status = ?1, finished_at = datetime('now'), \
             records_read = ?2, records_written = ?3, records_skipped = ?4, error_message = ?5 \
             WHERE id = ?6",
            rusqlite::params![
                status.as_str(),
                stats.records_read as i64,
                stats.records_written as i64,
                stats.records_skipped as i64,
                stats.error_message,
                run_id,
            ],
        )?;
        Ok(())
    }
}
