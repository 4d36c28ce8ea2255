//! Startup recovery of jobs orphaned by a previous process.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::jobs::model::Job;
use crate::store::traits::JobStore;

/// Exit reason written on orphaned jobs.
pub const ORPHANED_REASON: &str = "Interrupted by a restart; marked stuck";

/// Relabels jobs left queued or running by an earlier instance.
pub struct RecoveryManager {
    store: Arc<dyn JobStore>,
    instance_id: String,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn JobStore>, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
        }
    }

    /// Mark every orphaned job as a stuck error in one statement. Jobs owned
    /// by this instance are left alone.
    pub async fn recover_stuck_jobs(&self) -> Result<u64, DatabaseError> {
        let recovered = self
            .store
            .mark_orphaned_jobs(&self.instance_id, ORPHANED_REASON)
            .await?;
        if recovered > 0 {
            warn!(recovered, "Marked orphaned jobs as stuck");
        } else {
            info!("No orphaned jobs found");
        }
        Ok(recovered)
    }

    /// Jobs carrying the stuck marker, for manual reset.
    pub async fn stuck_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        self.store.list_stuck_jobs().await
    }
}
