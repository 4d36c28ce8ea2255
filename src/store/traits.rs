//! `JobStore` trait: the async persistence interface for jobs and their logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobId, JobOptions};
use crate::stream::entry::{LogEntry, NewLogEntry};

/// Backend-agnostic store for job records and per-job log entries.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Persist a newly submitted job, tagged with the owning process instance.
    async fn insert_job(
        &self,
        job: &Job,
        options: &JobOptions,
        instance_id: &str,
    ) -> Result<(), DatabaseError>;

    /// Write the job's status, exit reason and timestamps.
    ///
    /// Rows already in a terminal state are left untouched; returns whether a
    /// row was updated.
    async fn update_job_status(&self, job: &Job) -> Result<bool, DatabaseError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError>;

    /// Most recent jobs for one entity, newest first.
    async fn list_jobs_for_entity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Jobs carrying the stuck marker, newest first.
    async fn list_stuck_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Relabel every queued/running job not owned by `current_instance` as a
    /// stuck error, in one statement. Returns the number of jobs relabeled.
    async fn mark_orphaned_jobs(
        &self,
        current_instance: &str,
        reason: &str,
    ) -> Result<u64, DatabaseError>;

    /// Delete terminal jobs finished before `cutoff`, with their logs.
    async fn prune_finished_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, DatabaseError>;

    // ── Logs ────────────────────────────────────────────────────────

    /// Insert `entries` with consecutive sequence numbers starting at
    /// `first_seq`. Large batches may be written in several statements, so a
    /// failure can leave a stored prefix behind; sequence numbers already
    /// present are skipped, which makes replaying the whole batch safe.
    async fn append_log_entries(
        &self,
        job_id: JobId,
        first_seq: i64,
        entries: &[NewLogEntry],
    ) -> Result<(), DatabaseError>;

    /// Highest stored sequence number for a job, or 0.
    async fn max_log_seq(&self, job_id: JobId) -> Result<i64, DatabaseError>;

    /// Entries with `seq > after_seq`, ascending.
    async fn read_log_entries(
        &self,
        job_id: JobId,
        after_seq: i64,
    ) -> Result<Vec<LogEntry>, DatabaseError>;
}
