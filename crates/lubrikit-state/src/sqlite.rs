//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use lubrikit_types::envelope::{DlqRecord, Timestamp};
use lubrikit_types::error::ErrorKind;
use lubrikit_types::state::{CheckpointState, CollectorName, PipelineId, RunStats, RunStatus};
use rusqlite::{Connection, OptionalExtension};

use crate::backend::StateBackend;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS checkpoints (
    pipeline TEXT NOT NULL,
    collector TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, collector)
);

CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_collected INTEGER DEFAULT 0,
    records_delivered INTEGER DEFAULT 0,
    records_dropped INTEGER DEFAULT 0,
    records_dead_lettered INTEGER DEFAULT 0,
    retries INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS dlq_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id),
    stage TEXT NOT NULL,
    origin TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    record_json TEXT NOT NULL,
    error_message TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_dlq_pipeline_run ON dlq_records (pipeline, run_id);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    /// Convert an ISO-8601 string to `SQLite` datetime format.
    fn iso8601_to_sqlite(iso: &str) -> String {
        chrono::DateTime::parse_from_rfc3339(iso).map_or_else(
            |_| iso.to_string(),
            |dt| dt.format(SQLITE_DATETIME_FMT).to_string(),
        )
    }

    #[cfg(test)]
    fn get_run_row(
        &self,
        run_id: i64,
    ) -> error::Result<(String, i64, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, records_collected, retries, finished_at, error_message \
             FROM pipeline_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .map_err(StateError::backend)
    }
}

impl StateBackend for SqliteStateBackend {
    #[allow(clippy::cast_sign_loss)]
    fn get_checkpoint(
        &self,
        pipeline: &PipelineId,
        collector: &CollectorName,
    ) -> error::Result<Option<CheckpointState>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT sequence, updated_at FROM checkpoints \
                 WHERE pipeline = ?1 AND collector = ?2",
                rusqlite::params![pipeline.as_str(), collector.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_checkpoint", e))?;

        Ok(row.map(|(sequence, updated_at)| CheckpointState {
            sequence: sequence as u64,
            updated_at: Self::sqlite_to_iso8601(&updated_at),
        }))
    }

    #[allow(clippy::cast_possible_wrap)]
    fn set_checkpoint(
        &self,
        pipeline: &PipelineId,
        collector: &CollectorName,
        checkpoint: &CheckpointState,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let updated_at = Self::iso8601_to_sqlite(&checkpoint.updated_at);
        conn.execute(
            "INSERT INTO checkpoints (pipeline, collector, sequence, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(pipeline, collector) \
             DO UPDATE SET sequence = ?3, updated_at = ?4",
            rusqlite::params![
                pipeline.as_str(),
                collector.as_str(),
                checkpoint.sequence as i64,
                updated_at,
            ],
        )
        .map_err(|e| StateError::backend_context("set_checkpoint", e))?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn advance_checkpoint(
        &self,
        pipeline: &PipelineId,
        collector: &CollectorName,
        sequence: u64,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let rows_affected = conn
            .execute(
                "INSERT INTO checkpoints (pipeline, collector, sequence, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(pipeline, collector) \
                 DO UPDATE SET sequence = excluded.sequence, updated_at = excluded.updated_at \
                 WHERE excluded.sequence > checkpoints.sequence",
                rusqlite::params![
                    pipeline.as_str(),
                    collector.as_str(),
                    sequence as i64,
                    Self::now_sqlite(),
                ],
            )
            .map_err(|e| StateError::backend_context("advance_checkpoint", e))?;
        Ok(rows_affected > 0)
    }

    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipeline_runs (pipeline, status) VALUES (?1, ?2)",
            rusqlite::params![pipeline.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, finished_at = datetime('now'), \
             records_collected = ?2, records_delivered = ?3, records_dropped = ?4, \
             records_dead_lettered = ?5, retries = ?6, error_message = ?7 \
             WHERE id = ?8",
            rusqlite::params![
                status.as_str(),
                stats.records_collected as i64,
                stats.records_delivered as i64,
                stats.records_dropped as i64,
                stats.records_dead_lettered as i64,
                stats.retries as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn insert_dlq_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[DlqRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_dlq_records: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO dlq_records \
                 (pipeline, run_id, stage, origin, sequence, record_json, error_message, \
                  error_kind, attempts, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .map_err(|e| StateError::backend_context("insert_dlq_records: prepare", e))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                pipeline.as_str(),
                run_id,
                record.stage,
                record.origin,
                record.sequence as i64,
                record.record_json,
                record.error_message,
                record.error_kind.to_string(),
                record.attempts,
                record.failed_at.as_str(),
            ])
            .map_err(|e| StateError::backend_context("insert_dlq_records: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_dlq_records: commit", e))?;

        Ok(count)
    }

    #[allow(clippy::cast_sign_loss)]
    fn list_dlq_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
    ) -> error::Result<Vec<DlqRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT stage, origin, sequence, record_json, error_message, error_kind, \
                 attempts, failed_at FROM dlq_records \
                 WHERE pipeline = ?1 AND run_id = ?2 ORDER BY id",
            )
            .map_err(|e| StateError::backend_context("list_dlq_records: prepare", e))?;

        let rows = stmt
            .query_map(rusqlite::params![pipeline.as_str(), run_id], |row| {
                let kind: String = row.get(5)?;
                let error_kind = kind.parse::<ErrorKind>().map_err(|msg| {
                    rusqlite::Error::FromSqlConversionFailure(
                        5,
                        rusqlite::types::Type::Text,
                        msg.into(),
                    )
                })?;
                Ok(DlqRecord {
                    stage: row.get(0)?,
                    origin: row.get(1)?,
                    sequence: row.get::<_, i64>(2)? as u64,
                    record_json: row.get(3)?,
                    error_message: row.get(4)?,
                    error_kind,
                    attempts: row.get(6)?,
                    failed_at: Timestamp::new(row.get::<_, String>(7)?),
                })
            })
            .map_err(|e| StateError::backend_context("list_dlq_records: query", e))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("list_dlq_records: read row", e))
    }
}
