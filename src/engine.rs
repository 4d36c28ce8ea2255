//! The research engine: one handle over scheduling, logs, delivery and
//! recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::delivery::hub::EventHub;
use crate::delivery::subscription::{EventDelivery, Subscription};
use crate::error::{DatabaseError, Error, JobError};
use crate::jobs::model::{Job, JobId, JobOptions, JobSpec, JobType};
use crate::jobs::recovery::RecoveryManager;
use crate::jobs::registry::JobRegistry;
use crate::jobs::scheduler::JobScheduler;
use crate::store::log_store::LogStore;
use crate::store::traits::JobStore;
use crate::stream::entry::LogEntry;

/// How often finished jobs past the retention window are pruned.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

/// Job history returned per entity.
pub const ENTITY_HISTORY_LIMIT: usize = 50;

pub struct ResearchEngine {
    config: EngineConfig,
    instance_id: String,
    store: Arc<dyn JobStore>,
    logs: Arc<LogStore>,
    scheduler: Arc<JobScheduler>,
    recovery: RecoveryManager,
    delivery: EventDelivery,
    flusher_stop: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl ResearchEngine {
    /// Wire the engine on top of an opened, migrated store and start its
    /// log flusher. Must be called from within a Tokio runtime.
    pub fn new(config: EngineConfig, store: Arc<dyn JobStore>) -> Self {
        let instance_id = Uuid::new_v4().to_string();
        let hub = EventHub::new();
        let logs = Arc::new(LogStore::new(
            Arc::clone(&store),
            hub.clone(),
            config.log_store.clone(),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            config.clone(),
            instance_id.clone(),
            Arc::clone(&store),
            Arc::new(JobRegistry::new()),
            Arc::clone(&logs),
            hub.clone(),
        ));
        let recovery = RecoveryManager::new(Arc::clone(&store), instance_id.clone());
        let delivery = EventDelivery::new(Arc::clone(&store), hub, config.poll_interval);
        let flusher_stop = CancellationToken::new();
        let flusher = logs.spawn_flusher(flusher_stop.clone());

        info!(
            instance_id = %instance_id,
            max_concurrent = config.max_concurrent_jobs,
            agent = %config.agent.program,
            "Research engine ready"
        );

        Self {
            config,
            instance_id,
            store,
            logs,
            scheduler,
            recovery,
            delivery,
            flusher_stop,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue a job; returns its id without waiting for it to run.
    pub async fn start_job(
        &self,
        job_type: JobType,
        entity_id: impl Into<String>,
        options: JobOptions,
    ) -> Result<JobId, JobError> {
        let spec = JobSpec {
            job_type,
            entity_id: entity_id.into(),
            options,
        };
        self.scheduler.start(spec).await
    }

    /// Cancel a queued or running job. A job that is unknown, finished or
    /// already killed yields `NotFound`.
    pub async fn kill_job(&self, job_id: JobId) -> Result<(), JobError> {
        self.scheduler.kill(job_id).await
    }

    pub async fn active_jobs(&self) -> Vec<Job> {
        self.scheduler.active_jobs().await
    }

    /// Number of queued or running jobs.
    pub async fn active_count(&self) -> usize {
        self.scheduler.active_count().await
    }

    /// Stored log entries after `after_seq`, or all of them.
    pub async fn job_logs(
        &self,
        job_id: JobId,
        after_seq: Option<i64>,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        self.logs.flush(job_id).await;
        self.logs.read(job_id, after_seq.unwrap_or(0)).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, DatabaseError> {
        self.store.get_job(job_id).await
    }

    pub async fn jobs_for_entity(&self, entity_id: &str) -> Result<Vec<Job>, DatabaseError> {
        self.store
            .list_jobs_for_entity(entity_id, ENTITY_HISTORY_LIMIT)
            .await
    }

    /// Relabel jobs orphaned by an earlier process as stuck errors.
    pub async fn recover_stuck_jobs(&self) -> Result<u64, DatabaseError> {
        self.recovery.recover_stuck_jobs().await
    }

    pub async fn stuck_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        self.recovery.stuck_jobs().await
    }

    /// Follow a job's log and completion from `after_seq`.
    pub async fn subscribe(&self, job_id: JobId, after_seq: i64) -> Result<Subscription, Error> {
        self.delivery.subscribe(job_id, after_seq).await
    }

    /// Delete finished jobs older than the retention window.
    pub async fn prune_expired(&self) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.log_retention_days));
        let pruned = self.store.prune_finished_jobs(cutoff).await?;
        if pruned > 0 {
            info!(pruned, cutoff = %cutoff, "Pruned expired jobs");
        } else {
            debug!("No expired jobs to prune");
        }
        Ok(pruned)
    }

    /// Start the hourly housekeeping loop.
    pub fn spawn_housekeeping(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.prune_expired().await {
                            error!(error = %e, "Housekeeping failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Housekeeping stopped");
        })
    }

    /// Cancel every live job, wait for them to finalize and flush all logs.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.flusher_stop.cancel();
        let flusher = self.flusher.lock().await.take();
        match flusher {
            // The flusher drains every buffer once more before exiting.
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "Log flusher task failed");
                    self.logs.flush_all().await;
                }
            }
            None => self.logs.flush_all().await,
        }
        info!("Research engine stopped");
    }
}

impl Drop for ResearchEngine {
    fn drop(&mut self) {
        self.flusher_stop.cancel();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::AgentCommandConfig;
    use crate::delivery::subscription::DeliveryEvent;
    use crate::jobs::model::JobStatus;
    use crate::store::libsql_backend::LibSqlJobStore;
    use crate::stream::entry::LogKind;

    async fn engine(script: &str) -> (Arc<ResearchEngine>, Arc<dyn JobStore>) {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let config = EngineConfig {
            poll_interval: Duration::from_millis(50),
            agent: AgentCommandConfig {
                program: "sh".into(),
                leading_args: vec!["-c".into(), script.into(), "fake-agent".into()],
                model: None,
            },
            ..EngineConfig::default()
        };
        (
            Arc::new(ResearchEngine::new(config, Arc::clone(&store))),
            store,
        )
    }

    #[tokio::test]
    async fn job_runs_and_streams_to_completion() {
        let (engine, _store) = engine(
            r#"echo '{"type":"result","subtype":"success","is_error":false,"duration_ms":1200,"num_turns":2,"result":"done"}'"#,
        )
        .await;

        let id = engine
            .start_job(JobType::EntityResearch, "acme", JobOptions::default())
            .await
            .unwrap();
        let mut sub = engine.subscribe(id, 0).await.unwrap();

        let mut kinds = Vec::new();
        let complete = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match sub.next().await {
                    Some(DeliveryEvent::Log { entry }) => kinds.push(entry.kind),
                    Some(DeliveryEvent::Complete { status, message }) => break (status, message),
                    Some(DeliveryEvent::Error { message }) => panic!("delivery error: {message}"),
                    None => panic!("stream ended without complete"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(complete.0, JobStatus::Completed);
        assert!(complete.1.contains("acme"));
        assert!(kinds.contains(&LogKind::System));
        assert!(sub.next().await.is_none());

        let history = engine.jobs_for_entity("acme").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(engine.job_logs(id, None).await.unwrap().len(), kinds.len());
        assert_eq!(
            engine.job_logs(id, Some(1)).await.unwrap().len(),
            kinds.len() - 1
        );
    }

    #[tokio::test]
    async fn recovery_ignores_this_instances_jobs() {
        let (engine, store) = engine("sleep 30").await;
        let orphan = Job::queued(&JobSpec::new(JobType::EntityScoring, "old-lead"));
        store
            .insert_job(&orphan, &JobOptions::default(), "previous-instance")
            .await
            .unwrap();

        let live = engine
            .start_job(JobType::EntityResearch, "acme", JobOptions::default())
            .await
            .unwrap();

        assert_eq!(engine.recover_stuck_jobs().await.unwrap(), 1);
        let stuck = engine.stuck_jobs().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, orphan.id);
        assert!(engine.get_job(live).await.unwrap().unwrap().status.is_active());

        engine.shutdown().await;
        let job = engine.get_job(live).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Killed);
    }

    #[tokio::test]
    async fn prune_keeps_recent_jobs() {
        let (engine, store) = engine("exit 0").await;
        let mut job = Job::queued(&JobSpec::new(JobType::EntityResearch, "acme"));
        store
            .insert_job(&job, &JobOptions::default(), engine.instance_id())
            .await
            .unwrap();
        job.transition_to(JobStatus::Killed, None).unwrap();
        store.update_job_status(&job).await.unwrap();

        assert_eq!(engine.prune_expired().await.unwrap(), 0);
        assert!(engine.get_job(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn live_logs_flush_on_the_timer() {
        // Far below the size threshold, so only the engine's own flusher
        // can make these visible before the job ends.
        let (engine, _store) = engine("echo one; echo two; sleep 30").await;
        assert!(engine.config().log_store.flush_threshold > 3);

        let id = engine
            .start_job(JobType::EntityResearch, "acme", JobOptions::default())
            .await
            .unwrap();
        let mut sub = engine.subscribe(id, 0).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("no entry arrived while the job was running");
        assert!(matches!(first, Some(DeliveryEvent::Log { .. })));
        assert!(engine.get_job(id).await.unwrap().unwrap().status.is_active());
        assert_eq!(engine.active_count().await, 1);

        engine.kill_job(id).await.unwrap();
        engine.shutdown().await;
        assert_eq!(engine.active_count().await, 0);
    }
}
