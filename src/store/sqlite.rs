//! SQLite-backed durable job store.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::{Job, JobStatus};
use crate::store::{apply_update, JobFilter, JobStore};

/// Durable job store. Each job is one row; the full record is kept as JSON
/// next to the columns the store filters on.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    max_jobs: usize,
}

impl SqliteJobStore {
    pub fn open(path: &Path, max_jobs: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| OrchestratorError::Store(format!("open sqlite job store: {}", e)))?;
        Self::from_connection(conn, max_jobs)
    }

    /// Store backed by a private in-process database; useful in tests.
    pub fn open_in_memory(max_jobs: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| OrchestratorError::Store(format!("open sqlite job store: {}", e)))?;
        Self::from_connection(conn, max_jobs)
    }

    fn from_connection(conn: Connection, max_jobs: usize) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_jobs,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OrchestratorError::Store("sqlite job store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              idempotency_key TEXT NOT NULL UNIQUE,
              status TEXT NOT NULL,
              runtime TEXT NOT NULL,
              version INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              record_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_updated ON jobs(status, updated_at_ms);
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at_ms);
            "#,
        )
        .map_err(|e| OrchestratorError::Store(format!("init sqlite job schema: {}", e)))?;
        Ok(())
    }

    fn load(conn: &Connection, id: Uuid) -> Result<Option<Job>> {
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(OrchestratorError::from))
            .transpose()
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: Job) -> Result<Job> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
        if count as usize >= self.max_jobs {
            // A duplicate still reports as a duplicate, even at capacity
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM jobs WHERE idempotency_key = ?1",
                    params![job.idempotency_key],
                    |r| r.get(0),
                )
                .optional()?;
            return match existing.and_then(|id| Uuid::parse_str(&id).ok()) {
                Some(job_id) => Err(OrchestratorError::Duplicate {
                    key: job.idempotency_key.clone(),
                    job_id,
                }),
                None => Err(OrchestratorError::QueueFull),
            };
        }

        let record = serde_json::to_string(&job)?;
        let insert = conn.execute(
            "INSERT INTO jobs
             (id, idempotency_key, status, runtime, version, created_at_ms, updated_at_ms, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id.to_string(),
                job.idempotency_key,
                job.status.as_str(),
                job.runtime.as_str(),
                job.version as i64,
                dt_to_ms(job.created_at),
                dt_to_ms(job.updated_at),
                record,
            ],
        );
        match insert {
            Ok(_) => Ok(job),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let existing: String = conn.query_row(
                    "SELECT id FROM jobs WHERE idempotency_key = ?1",
                    params![job.idempotency_key],
                    |r| r.get(0),
                )?;
                let job_id = Uuid::parse_str(&existing)
                    .map_err(|e| OrchestratorError::Store(format!("corrupt job id: {}", e)))?;
                Err(OrchestratorError::Duplicate {
                    key: job.idempotency_key.clone(),
                    job_id,
                })
            }
            Err(e) => Err(OrchestratorError::Store(format!("insert job: {}", e))),
        }
    }

    fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.lock()?;
        Self::load(&conn, id)
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM jobs WHERE idempotency_key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(OrchestratorError::from))
            .transpose()
    }

    fn update(&self, id: Uuid, expected: JobStatus, mutation: &dyn Fn(&mut Job)) -> Result<Job> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| OrchestratorError::Store(format!("begin update tx: {}", e)))?;

        let current = Self::load(&tx, id)?.ok_or(OrchestratorError::JobNotFound(id))?;
        let next = apply_update(&current, expected, mutation)?;

        // The version guard keeps this safe against writers in other processes
        let changed = tx.execute(
            "UPDATE jobs SET status = ?1, version = ?2, updated_at_ms = ?3, record_json = ?4
             WHERE id = ?5 AND version = ?6",
            params![
                next.status.as_str(),
                next.version as i64,
                dt_to_ms(next.updated_at),
                serde_json::to_string(&next)?,
                id.to_string(),
                current.version as i64,
            ],
        )?;
        if changed == 0 {
            let actual = Self::load(&tx, id)?
                .map(|j| j.status)
                .unwrap_or(current.status);
            return Err(OrchestratorError::Conflict {
                job_id: id,
                expected,
                actual,
            });
        }
        tx.commit()
            .map_err(|e| OrchestratorError::Store(format!("commit update tx: {}", e)))?;
        Ok(next)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM jobs
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR runtime = ?2)
               AND (?3 IS NULL OR updated_at_ms < ?3)
             ORDER BY created_at_ms ASC, rowid ASC
             LIMIT ?4",
        )?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt.query_map(
            params![
                filter.status.map(|s| s.as_str()),
                filter.runtime.map(|r| r.as_str()),
                filter.updated_before.map(dt_to_ms),
                limit,
            ],
            |r| r.get::<_, String>(0),
        )?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(serde_json::from_str(&row?)?);
        }
        Ok(jobs)
    }

    fn evict_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM jobs WHERE status IN (?1, ?2, ?3) AND updated_at_ms < ?4",
            params![
                JobStatus::Succeeded.as_str(),
                JobStatus::Failed.as_str(),
                JobStatus::TimedOut.as_str(),
                dt_to_ms(before),
            ],
        )?;
        Ok(removed)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}
