//! In-process fan-out of job notices to delivery subscribers.

use tokio::sync::broadcast;
use tracing::debug;

use crate::jobs::model::{JobId, JobStatus};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Something changed for a job. Subscribers re-read the store on receipt,
/// so a dropped notice only delays delivery until the next poll tick.
#[derive(Debug, Clone, PartialEq)]
pub enum JobNotice {
    /// Entries up to `last_seq` are persisted.
    Appended { job_id: JobId, last_seq: i64 },
    /// The job reached a terminal status and its logs are flushed.
    Finished {
        job_id: JobId,
        status: JobStatus,
        message: String,
    },
}

impl JobNotice {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Appended { job_id, .. } | Self::Finished { job_id, .. } => *job_id,
        }
    }
}

/// Broadcast hub. Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<JobNotice>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobNotice> {
        self.tx.subscribe()
    }

    pub fn notify_appended(&self, job_id: JobId, last_seq: i64) {
        // Ok if nobody is listening
        let _ = self.tx.send(JobNotice::Appended { job_id, last_seq });
    }

    pub fn notify_finished(&self, job_id: JobId, status: JobStatus, message: impl Into<String>) {
        let message = message.into();
        debug!(job_id = %job_id, status = %status, "Broadcasting job completion");
        let _ = self.tx.send(JobNotice::Finished {
            job_id,
            status,
            message,
        });
    }
}
