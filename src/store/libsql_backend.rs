//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobId, JobOptions, JobStatus, JobType};
use crate::store::migrations;
use crate::store::traits::JobStore;
use crate::stream::entry::{LogEntry, LogKind, NewLogEntry};

/// Rows per multi-row INSERT when appending log entries.
const LOG_INSERT_CHUNK: usize = 64;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for writes.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

const JOB_COLUMNS: &str =
    "id, job_type, entity_id, status, exit_reason, stuck, created_at, started_at, finished_at";

const LOG_COLUMNS: &str = "job_id, seq, kind, content, tool_name, metadata, created_at";

const ACTIVE_STATUSES: &str = "('queued', 'running')";

const TERMINAL_STATUSES: &str = "('completed', 'error', 'timeout', 'killed')";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("job row: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let job_type_str: String = row.get(1).map_err(get_err)?;
    let entity_id: String = row.get(2).map_err(get_err)?;
    let status_str: String = row.get(3).map_err(get_err)?;
    let exit_reason: Option<String> = row.get(4).map_err(get_err)?;
    let stuck: i64 = row.get(5).map_err(get_err)?;
    let created_str: String = row.get(6).map_err(get_err)?;
    let started_str: Option<String> = row.get(7).map_err(get_err)?;
    let finished_str: Option<String> = row.get(8).map_err(get_err)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job id {id_str:?}: {e}")))?;
    let job_type: JobType = job_type_str
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let status: JobStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    Ok(Job {
        id,
        job_type,
        entity_id,
        status,
        exit_reason,
        stuck: stuck != 0,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        finished_at: parse_optional_datetime(&finished_str),
    })
}

fn row_to_log_entry(row: &libsql::Row) -> Result<LogEntry, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("log row: {e}"));

    let job_id_str: String = row.get(0).map_err(get_err)?;
    let seq: i64 = row.get(1).map_err(get_err)?;
    let kind_str: String = row.get(2).map_err(get_err)?;
    let content: String = row.get(3).map_err(get_err)?;
    let tool_name: Option<String> = row.get(4).map_err(get_err)?;
    let metadata_str: Option<String> = row.get(5).map_err(get_err)?;
    let created_str: String = row.get(6).map_err(get_err)?;

    let job_id = Uuid::parse_str(&job_id_str)
        .map_err(|e| DatabaseError::Serialization(format!("log job id {job_id_str:?}: {e}")))?;
    let kind: LogKind = kind_str.parse().map_err(DatabaseError::Serialization)?;
    let metadata = match metadata_str {
        Some(s) => match serde_json::from_str(&s) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(job_id = %job_id, seq, error = %e, "Dropping unreadable log metadata");
                None
            }
        },
        None => None,
    };

    Ok(LogEntry {
        job_id,
        seq,
        kind,
        content,
        tool_name,
        metadata,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(
        &self,
        job: &Job,
        options: &JobOptions,
        instance_id: &str,
    ) -> Result<(), DatabaseError> {
        let options_json = serde_json::to_string(options)
            .map_err(|e| DatabaseError::Serialization(format!("job options: {e}")))?;
        let now = ts(Utc::now());

        self.conn()
            .execute(
                "INSERT INTO jobs (id, job_type, entity_id, status, exit_reason, options, \
                 created_at, started_at, finished_at, updated_at, instance_id, stuck) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    job.entity_id.clone(),
                    job.status.as_str(),
                    opt_text(job.exit_reason.clone()),
                    options_json,
                    ts(job.created_at),
                    opt_text(job.started_at.map(ts)),
                    opt_text(job.finished_at.map(ts)),
                    now,
                    instance_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_job", e))?;

        debug!(job_id = %job.id, entity_id = %job.entity_id, "Job inserted into DB");
        Ok(())
    }

    async fn update_job_status(&self, job: &Job) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE jobs SET status = ?1, exit_reason = ?2, started_at = ?3, \
                     finished_at = ?4, updated_at = ?5 \
                     WHERE id = ?6 AND status IN {ACTIVE_STATUSES}"
                ),
                params![
                    job.status.as_str(),
                    opt_text(job.exit_reason.clone()),
                    opt_text(job.started_at.map(ts)),
                    opt_text(job.finished_at.map(ts)),
                    ts(Utc::now()),
                    job.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("update_job_status", e))?;

        debug!(job_id = %job.id, status = %job.status, changed, "Job status updated in DB");
        Ok(changed > 0)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_job", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_job", e)),
        }
    }

    async fn list_jobs_for_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE entity_id = ?1 \
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![entity_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_jobs_for_entity", e))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn list_stuck_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE stuck = 1 ORDER BY created_at DESC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_stuck_jobs", e))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn mark_orphaned_jobs(
        &self,
        current_instance: &str,
        reason: &str,
    ) -> Result<u64, DatabaseError> {
        let now = ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE jobs SET status = 'error', stuck = 1, exit_reason = ?1, \
                     finished_at = ?2, updated_at = ?2 \
                     WHERE status IN {ACTIVE_STATUSES} AND instance_id != ?3"
                ),
                params![reason, now, current_instance],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("mark_orphaned_jobs", e))?;
        Ok(changed)
    }

    async fn prune_finished_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let cutoff = ts(cutoff);
        let conn = self.conn();

        conn.execute(
            &format!(
                "DELETE FROM job_logs WHERE job_id IN (\
                 SELECT id FROM jobs WHERE status IN {TERMINAL_STATUSES} AND finished_at < ?1)"
            ),
            params![cutoff.clone()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("prune_finished_jobs(logs)", e))?;

        let deleted = conn
            .execute(
                &format!(
                    "DELETE FROM jobs WHERE status IN {TERMINAL_STATUSES} AND finished_at < ?1"
                ),
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("prune_finished_jobs", e))?;
        Ok(deleted)
    }

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log_entries(
        &self,
        job_id: JobId,
        first_seq: i64,
        entries: &[NewLogEntry],
    ) -> Result<(), DatabaseError> {
        let job_id_str = job_id.to_string();

        for (chunk_idx, chunk) in entries.chunks(LOG_INSERT_CHUNK).enumerate() {
            let base = first_seq + (chunk_idx * LOG_INSERT_CHUNK) as i64;
            let mut placeholders = Vec::with_capacity(chunk.len());
            let mut values: Vec<libsql::Value> = Vec::with_capacity(chunk.len() * 7);

            for (i, entry) in chunk.iter().enumerate() {
                let p = i * 7;
                placeholders.push(format!(
                    "(?{}, ?{}, ?{}, ?{}, ?{}, ?{}, ?{})",
                    p + 1,
                    p + 2,
                    p + 3,
                    p + 4,
                    p + 5,
                    p + 6,
                    p + 7
                ));
                values.push(libsql::Value::Text(job_id_str.clone()));
                values.push(libsql::Value::Integer(base + i as i64));
                values.push(libsql::Value::Text(entry.kind.as_str().to_string()));
                values.push(libsql::Value::Text(entry.content.clone()));
                values.push(opt_text(entry.tool_name.clone()));
                values.push(opt_text(entry.metadata.as_ref().map(|m| m.to_string())));
                values.push(libsql::Value::Text(ts(entry.created_at)));
            }

            // Already-stored sequence numbers are skipped, so a retried
            // batch never duplicates rows.
            let sql = format!(
                "INSERT OR IGNORE INTO job_logs ({LOG_COLUMNS}) VALUES {}",
                placeholders.join(", ")
            );
            self.conn()
                .execute(&sql, libsql::params::Params::Positional(values))
                .await
                .map_err(|e| DatabaseError::from_libsql("append_log_entries", e))?;
        }
        Ok(())
    }

    async fn max_log_seq(&self, job_id: JobId) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(seq), 0) FROM job_logs WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("max_log_seq", e))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("max_log_seq: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::from_libsql("max_log_seq", e)),
        }
    }

    async fn read_log_entries(
        &self,
        job_id: JobId,
        after_seq: i64,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM job_logs WHERE job_id = ?1 AND seq > ?2 \
                     ORDER BY seq ASC"
                ),
                params![job_id.to_string(), after_seq],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("read_log_entries", e))?;

        let mut entries = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => entries.push(row_to_log_entry(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::from_libsql("read_log_entries", e)),
            }
        }
        Ok(entries)
    }
}
