//! In-memory registry of live jobs.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::jobs::model::{Job, JobId, JobStatus};

struct LiveJob {
    job: Job,
    /// Taken on the first kill so a second kill is rejected.
    cancel: Option<CancellationToken>,
}

/// Tracks jobs between submission and their terminal transition.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, LiveJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly queued job with its cancellation token.
    pub async fn register(&self, job: Job, cancel: CancellationToken) {
        self.jobs.write().await.insert(
            job.id,
            LiveJob {
                job,
                cancel: Some(cancel),
            },
        );
    }

    /// Move a live job to `target`, returning the updated snapshot.
    pub async fn transition(
        &self,
        job_id: JobId,
        target: JobStatus,
        reason: Option<String>,
    ) -> Result<Job, JobError> {
        let mut jobs = self.jobs.write().await;
        let live = jobs
            .get_mut(&job_id)
            .ok_or(JobError::NotFound { id: job_id })?;
        let state = live.job.status;
        live.job
            .transition_to(target, reason)
            .map_err(|_| JobError::InvalidTransition {
                id: job_id,
                state: state.to_string(),
                target: target.to_string(),
            })?;
        Ok(live.job.clone())
    }

    /// Drop a job from the live set.
    pub async fn remove(&self, job_id: JobId) -> Option<Job> {
        self.jobs.write().await.remove(&job_id).map(|l| l.job)
    }

    /// Fire the job's cancellation token.
    ///
    /// Fails with `NotFound` if the job is unknown, already finished, or was
    /// already killed.
    pub async fn kill(&self, job_id: JobId) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        let token = jobs
            .get_mut(&job_id)
            .filter(|l| l.job.status.is_active())
            .and_then(|l| l.cancel.take())
            .ok_or(JobError::NotFound { id: job_id })?;
        token.cancel();
        Ok(())
    }

    /// Snapshot of all queued or running jobs, oldest first.
    pub async fn active(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|l| l.job.status.is_active())
            .map(|l| l.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|l| l.job.status.is_active())
            .count()
    }

    /// Cancel every live job. Used on shutdown.
    pub async fn cancel_all(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let mut cancelled = 0;
        for live in jobs.values_mut() {
            if let Some(token) = live.cancel.take() {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobSpec, JobType};

    fn queued_job(entity: &str) -> Job {
        Job::queued(&JobSpec::new(JobType::EntityResearch, entity))
    }

    #[tokio::test]
    async fn register_and_list_active() {
        let registry = JobRegistry::new();
        let a = queued_job("a");
        let b = queued_job("b");
        registry.register(a.clone(), CancellationToken::new()).await;
        registry.register(b.clone(), CancellationToken::new()).await;

        let active = registry.active().await;
        assert_eq!(active.len(), 2);
        assert_eq!(registry.active_count().await, 2);

        registry.remove(a.id).await;
        assert_eq!(registry.active().await, vec![b]);
    }

    #[tokio::test]
    async fn transition_updates_snapshot() {
        let registry = JobRegistry::new();
        let job = queued_job("lead");
        registry.register(job.clone(), CancellationToken::new()).await;

        let running = registry
            .transition(job.id, JobStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        let err = registry
            .transition(job.id, JobStatus::Queued, None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn kill_cancels_once() {
        let registry = JobRegistry::new();
        let job = queued_job("lead");
        let token = CancellationToken::new();
        registry.register(job.clone(), token.clone()).await;

        registry.kill(job.id).await.unwrap();
        assert!(token.is_cancelled());

        let second = registry.kill(job.id).await;
        assert!(matches!(second, Err(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn kill_unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        let result = registry.kill(uuid::Uuid::new_v4()).await;
        assert!(matches!(result, Err(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn cancel_all_fires_every_token() {
        let registry = JobRegistry::new();
        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        for (i, token) in tokens.iter().enumerate() {
            registry
                .register(queued_job(&format!("lead-{i}")), token.clone())
                .await;
        }
        assert_eq!(registry.cancel_all().await, 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
