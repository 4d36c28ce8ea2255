//! Buffered, per-job log appends on top of a [`JobStore`].
//!
//! Entries are buffered per job and flushed when the buffer reaches the
//! configured threshold, on every tick of the background flusher, or on an
//! explicit flush. Sequence numbers are assigned at flush time and advance
//! only after a batch is stored, so each job's log stays gapless.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::LogStoreConfig;
use crate::delivery::hub::EventHub;
use crate::error::DatabaseError;
use crate::jobs::model::JobId;
use crate::store::retry::{RetryPolicy, retry_storage_write};
use crate::store::traits::JobStore;
use crate::stream::entry::{LogEntry, NewLogEntry};

#[derive(Default)]
struct JobBuffer {
    pending: Vec<NewLogEntry>,
    /// Sequence number the next stored entry receives; `None` until seeded
    /// from the store.
    next_seq: Option<i64>,
}

/// Batching log writer and reader.
pub struct LogStore {
    store: Arc<dyn JobStore>,
    hub: EventHub,
    config: LogStoreConfig,
    policy: RetryPolicy,
    buffers: RwLock<HashMap<JobId, Arc<Mutex<JobBuffer>>>>,
}

impl LogStore {
    pub fn new(store: Arc<dyn JobStore>, hub: EventHub, config: LogStoreConfig) -> Self {
        let policy = RetryPolicy::from(&config);
        Self {
            store,
            hub,
            config,
            policy,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Queue entries for `job_id`. Flushes if the buffer is full.
    pub async fn append(&self, job_id: JobId, entries: Vec<NewLogEntry>) {
        if entries.is_empty() {
            return;
        }
        let buffer = self.buffer_for(job_id).await;
        let mut buf = buffer.lock().await;
        buf.pending.extend(entries);
        if buf.pending.len() >= self.config.flush_threshold {
            self.flush_locked(job_id, &mut buf).await;
        }
    }

    /// Write out whatever is buffered for one job.
    pub async fn flush(&self, job_id: JobId) {
        let buffer = self.buffers.read().await.get(&job_id).cloned();
        if let Some(buffer) = buffer {
            let mut buf = buffer.lock().await;
            self.flush_locked(job_id, &mut buf).await;
        }
    }

    /// Flush every job's buffer. Jobs flush concurrently, so one job stuck
    /// retrying a contended write does not hold back the others.
    pub async fn flush_all(&self) {
        let buffers: Vec<(JobId, Arc<Mutex<JobBuffer>>)> = self
            .buffers
            .read()
            .await
            .iter()
            .map(|(id, b)| (*id, Arc::clone(b)))
            .collect();
        join_all(buffers.into_iter().map(|(job_id, buffer)| async move {
            let mut buf = buffer.lock().await;
            self.flush_locked(job_id, &mut buf).await;
        }))
        .await;
    }

    /// Final flush for a finished job; drops its buffer.
    pub async fn finish(&self, job_id: JobId) {
        self.flush(job_id).await;
        self.buffers.write().await.remove(&job_id);
    }

    /// Stored entries with `seq > after_seq`.
    pub async fn read(&self, job_id: JobId, after_seq: i64) -> Result<Vec<LogEntry>, DatabaseError> {
        self.store.read_log_entries(job_id, after_seq).await
    }

    /// Periodically flush all buffers until `shutdown` fires, then flush once
    /// more.
    pub fn spawn_flusher(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => this.flush_all().await,
                    _ = shutdown.cancelled() => {
                        this.flush_all().await;
                        debug!("Log flusher stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn buffer_for(&self, job_id: JobId) -> Arc<Mutex<JobBuffer>> {
        if let Some(buffer) = self.buffers.read().await.get(&job_id) {
            return Arc::clone(buffer);
        }
        Arc::clone(self.buffers.write().await.entry(job_id).or_default())
    }

    /// Highest stored sequence number, retried like a write.
    async fn stored_max_seq(&self, job_id: JobId) -> Option<i64> {
        let store = Arc::clone(&self.store);
        retry_storage_write("max_log_seq", self.policy, DatabaseError::is_transient, || {
            let store = Arc::clone(&store);
            async move { store.max_log_seq(job_id).await }
        })
        .await
        .map_err(|e| warn!(job_id = %job_id, error = %e, "Could not read log sequence"))
        .ok()
    }

    async fn flush_locked(&self, job_id: JobId, buf: &mut JobBuffer) {
        if buf.pending.is_empty() {
            return;
        }

        let first_seq = match buf.next_seq {
            Some(seq) => seq,
            None => match self.stored_max_seq(job_id).await {
                Some(max) => {
                    buf.next_seq = Some(max + 1);
                    max + 1
                }
                // Keep the entries buffered; the next flush tries again.
                None => return,
            },
        };

        let batch = std::mem::take(&mut buf.pending);
        let count = batch.len() as i64;
        let store = Arc::clone(&self.store);
        let batch = Arc::new(batch);

        let result = retry_storage_write(
            "append_log_entries",
            self.policy,
            DatabaseError::is_transient,
            || {
                let store = Arc::clone(&store);
                let batch = Arc::clone(&batch);
                async move { store.append_log_entries(job_id, first_seq, &batch).await }
            },
        )
        .await;

        match result {
            Ok(()) => {
                let last_seq = first_seq + count - 1;
                buf.next_seq = Some(last_seq + 1);
                debug!(job_id = %job_id, first_seq, last_seq, "Flushed log entries");
                self.hub.notify_appended(job_id, last_seq);
            }
            Err(e) => {
                error!(
                    job_id = %job_id,
                    dropped = count,
                    error = %e,
                    "Giving up on log batch"
                );
                // Part of the batch may have landed; continue after whatever
                // the store actually holds.
                buf.next_seq = self.stored_max_seq(job_id).await.map(|max| max + 1);
                if let Some(next) = buf.next_seq
                    && next > first_seq
                {
                    self.hub.notify_appended(job_id, next - 1);
                }
            }
        }
    }
}
