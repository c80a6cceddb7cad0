use super::models::{JobRun, JobRunStatus};
use super::ServerStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// Bumped whenever the schema below changes; migrations run per version gap.
const SCHEMA_VERSION: i64 = 1;

pub struct SqliteServerStore {
    conn: Mutex<Connection>,
}

impl SqliteServerStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();
        if is_new_db {
            info!("Creating new server database at {:?}", path);
        }

        let conn = Connection::open(path).context("Failed to open server database")?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        let version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            anyhow::bail!(
                "Server database version {} is newer than supported version {}",
                version,
                SCHEMA_VERSION
            );
        }

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE job_runs (
                    id INTEGER PRIMARY KEY,
                    job_id TEXT NOT NULL,
                    invocation_id TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT,
                    triggered_by TEXT NOT NULL
                );
                CREATE INDEX idx_job_runs_job_id_started ON job_runs(job_id, started_at DESC);
                CREATE INDEX idx_job_runs_status ON job_runs(status);",
            )?;
        }

        conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
        Ok(())
    }

    fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    }

    fn row_to_job_run(row: &rusqlite::Row) -> rusqlite::Result<JobRun> {
        let status_str: String = row.get("status")?;
        let status = JobRunStatus::parse(&status_str).unwrap_or(JobRunStatus::Failed);

        let started_at_str: String = row.get("started_at")?;
        let finished_at_str: Option<String> = row.get("finished_at")?;

        Ok(JobRun {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            invocation_id: row.get("invocation_id")?,
            started_at: Self::parse_timestamp(&started_at_str)?,
            finished_at: finished_at_str
                .as_deref()
                .map(Self::parse_timestamp)
                .transpose()?,
            status,
            attempts: row.get("attempts")?,
            error_message: row.get("error_message")?,
            triggered_by: row.get("triggered_by")?,
        })
    }
}

impl ServerStore for SqliteServerStore {
    fn record_job_start(
        &self,
        job_id: &str,
        invocation_id: &str,
        triggered_by: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_runs (job_id, invocation_id, started_at, status, triggered_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                invocation_id,
                Utc::now().to_rfc3339(),
                JobRunStatus::Running.as_str(),
                triggered_by
            ],
        )
        .context("Failed to record job start")?;
        Ok(conn.last_insert_rowid())
    }

    fn record_job_finish(
        &self,
        run_id: i64,
        status: JobRunStatus,
        attempts: u32,
        error_message: Option<String>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_runs
             SET finished_at = ?1, status = ?2, attempts = ?3, error_message = ?4
             WHERE id = ?5",
            params![
                Utc::now().to_rfc3339(),
                status.as_str(),
                attempts,
                error_message,
                run_id
            ],
        )
        .context("Failed to record job finish")?;
        Ok(())
    }

    fn get_running_jobs(&self) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM job_runs WHERE status = ?1 ORDER BY started_at DESC",
        )?;
        let runs = stmt
            .query_map(params![JobRunStatus::Running.as_str()], Self::row_to_job_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM job_runs WHERE job_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![job_id, limit as i64], Self::row_to_job_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn get_last_run(&self, job_id: &str) -> Result<Option<JobRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT * FROM job_runs WHERE job_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![job_id],
                Self::row_to_job_run,
            )
            .optional()?;
        Ok(run)
    }

    fn mark_stale_jobs_failed(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE job_runs
             SET status = ?1, finished_at = ?2, error_message = ?3
             WHERE status = ?4",
            params![
                JobRunStatus::Failed.as_str(),
                Utc::now().to_rfc3339(),
                "Interrupted by server restart",
                JobRunStatus::Running.as_str()
            ],
        )?;
        Ok(updated)
    }
}
