//! Job scheduler: drives one job from submission to its terminal status.
//!
//! `start` persists and registers the job, then hands it to a tracked task
//! that waits for admission, runs the agent under the supervisor, pipes its
//! output through the parser into the log store and finally records the
//! outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::delivery::hub::EventHub;
use crate::error::{DatabaseError, JobError};
use crate::jobs::admission::{AdmissionRejected, AdmissionSemaphore};
use crate::jobs::invocation::{Invocation, resolve_program};
use crate::jobs::model::{Job, JobId, JobSpec, JobStatus};
use crate::jobs::registry::JobRegistry;
use crate::jobs::supervisor::{ExitOutcome, ProcessSupervisor};
use crate::store::log_store::LogStore;
use crate::store::retry::{RetryPolicy, retry_storage_write};
use crate::store::traits::JobStore;
use crate::stream::entry::{LogKind, NewLogEntry};
use crate::stream::parser::EventStreamParser;

/// Lines buffered between the process readers and the parser.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Runs jobs with bounded concurrency.
pub struct JobScheduler {
    config: EngineConfig,
    instance_id: String,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    logs: Arc<LogStore>,
    hub: EventHub,
    admission: AdmissionSemaphore,
    supervisor: ProcessSupervisor,
    tracker: TaskTracker,
    policy: RetryPolicy,
}

impl JobScheduler {
    pub fn new(
        config: EngineConfig,
        instance_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        logs: Arc<LogStore>,
        hub: EventHub,
    ) -> Self {
        let admission = AdmissionSemaphore::new(config.max_concurrent_jobs, config.queue_timeout);
        let supervisor = ProcessSupervisor::new(config.kill_grace);
        let policy = RetryPolicy::from(&config.log_store);
        Self {
            config,
            instance_id: instance_id.into(),
            store,
            registry,
            logs,
            hub,
            admission,
            supervisor,
            tracker: TaskTracker::new(),
            policy,
        }
    }

    /// Submit a job. Returns once it is persisted and queued; the job itself
    /// runs in the background.
    pub async fn start(self: &Arc<Self>, spec: JobSpec) -> Result<JobId, JobError> {
        let invocation = Invocation::for_job(&self.config.agent, &spec);
        resolve_program(&invocation.program)?;

        let job = Job::queued(&spec);
        let job_id = job.id;
        let store = Arc::clone(&self.store);
        retry_storage_write("insert_job", self.policy, DatabaseError::is_transient, || {
            let store = Arc::clone(&store);
            let job = job.clone();
            let options = spec.options.clone();
            let instance_id = self.instance_id.clone();
            async move { store.insert_job(&job, &options, &instance_id).await }
        })
        .await?;

        let cancel = CancellationToken::new();
        self.registry.register(job, cancel.clone()).await;
        info!(
            job_id = %job_id,
            job_type = %spec.job_type,
            entity_id = %spec.entity_id,
            "Job queued"
        );

        self.tracker
            .spawn(Arc::clone(self).drive(job_id, spec, invocation, cancel));
        Ok(job_id)
    }

    /// Request cancellation of a queued or running job.
    pub async fn kill(&self, job_id: JobId) -> Result<(), JobError> {
        self.registry.kill(job_id).await?;
        info!(job_id = %job_id, "Kill requested");
        Ok(())
    }

    /// Queued and running jobs, oldest first.
    pub async fn active_jobs(&self) -> Vec<Job> {
        self.registry.active().await
    }

    pub async fn active_count(&self) -> usize {
        self.registry.active_count().await
    }

    /// Admission slots currently held.
    pub fn running_count(&self) -> usize {
        self.admission.in_use()
    }

    /// Cancel every live job and wait for all of them to finalize.
    pub async fn shutdown(&self) {
        let cancelled = self.registry.cancel_all().await;
        if cancelled > 0 {
            info!(cancelled, "Cancelling live jobs for shutdown");
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn drive(
        self: Arc<Self>,
        job_id: JobId,
        spec: JobSpec,
        invocation: Invocation,
        cancel: CancellationToken,
    ) {
        let permit = match self.admission.acquire(&cancel).await {
            Ok(permit) => permit,
            Err(AdmissionRejected::Cancelled) => {
                self.finalize(job_id, JobStatus::Killed, Some("Killed while queued".into()))
                    .await;
                return;
            }
            Err(AdmissionRejected::TimedOut { waited }) => {
                let err = JobError::AdmissionQueueTimeoutExceeded { id: job_id, waited };
                warn!(job_id = %job_id, waited = ?waited, "Job never got a slot");
                self.logs
                    .append(job_id, vec![NewLogEntry::new(LogKind::Error, err.to_string())])
                    .await;
                self.finalize(job_id, JobStatus::Timeout, Some(err.to_string()))
                    .await;
                return;
            }
        };

        // Killed in the same instant the slot was granted.
        if cancel.is_cancelled() {
            drop(permit);
            self.finalize(job_id, JobStatus::Killed, Some("Killed while queued".into()))
                .await;
            return;
        }

        match self.registry.transition(job_id, JobStatus::Running, None).await {
            Ok(job) => self.persist(&job).await,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Could not mark job running");
                return;
            }
        }

        let deadline = spec
            .options
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.job_timeout);
        info!(
            job_id = %job_id,
            entity_id = %spec.entity_id,
            deadline = ?deadline,
            "Job running"
        );
        self.logs
            .append(
                job_id,
                vec![NewLogEntry::new(
                    LogKind::System,
                    format!("Starting {} for {}", spec.job_type, spec.entity_id),
                )],
            )
            .await;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump_output(
            job_id,
            rx,
            Arc::clone(&self.logs),
            self.config.content_cap,
        ));

        let outcome = self.supervisor.run(&invocation, deadline, &cancel, tx).await;
        if let Err(e) = pump.await {
            error!(job_id = %job_id, error = %e, "Output pump failed");
        }
        drop(permit);

        let (status, reason, entry) = match outcome {
            Ok(ExitOutcome::Completed { exit_code: 0 }) => (JobStatus::Completed, None, None),
            Ok(ExitOutcome::Completed { exit_code }) => {
                let reason = format!("Exited with code {exit_code}");
                let entry = NewLogEntry::new(LogKind::Error, reason.clone());
                (JobStatus::Error, Some(reason), Some(entry))
            }
            Ok(ExitOutcome::Timeout) => {
                let reason = JobError::JobTimeoutExceeded {
                    id: job_id,
                    timeout: deadline,
                }
                .to_string();
                let entry = NewLogEntry::new(LogKind::Error, reason.clone());
                (JobStatus::Timeout, Some(reason), Some(entry))
            }
            Ok(ExitOutcome::Killed) => {
                let reason = "Killed by request".to_string();
                let entry = NewLogEntry::new(LogKind::System, reason.clone());
                (JobStatus::Killed, Some(reason), Some(entry))
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Agent process failed");
                let reason = e.to_string();
                let entry = NewLogEntry::new(LogKind::Error, reason.clone());
                (JobStatus::Error, Some(reason), Some(entry))
            }
        };
        if let Some(entry) = entry {
            self.logs.append(job_id, vec![entry]).await;
        }
        self.finalize(job_id, status, reason).await;
    }

    /// Flush logs, record the terminal status, evict and notify.
    async fn finalize(&self, job_id: JobId, status: JobStatus, reason: Option<String>) {
        self.logs.finish(job_id).await;

        let job = match self.registry.transition(job_id, status, reason).await {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Could not finalize job");
                self.registry.remove(job_id).await;
                return;
            }
        };
        self.persist(&job).await;
        self.registry.remove(job_id).await;

        let summary = job.summary();
        match status {
            JobStatus::Completed => info!(job_id = %job_id, entity_id = %job.entity_id, "Job completed"),
            _ => warn!(
                job_id = %job_id,
                entity_id = %job.entity_id,
                status = %status,
                reason = job.exit_reason.as_deref().unwrap_or(""),
                "Job did not complete"
            ),
        }
        self.hub.notify_finished(job_id, status, summary);
    }

    /// Write the job's status. A failure is logged and never fails the job.
    async fn persist(&self, job: &Job) {
        let store = Arc::clone(&self.store);
        let result = retry_storage_write(
            "update_job_status",
            self.policy,
            DatabaseError::is_transient,
            || {
                let store = Arc::clone(&store);
                let job = job.clone();
                async move { store.update_job_status(&job).await }
            },
        )
        .await;
        match result {
            Ok(true) => debug!(job_id = %job.id, status = %job.status, "Job status stored"),
            Ok(false) => warn!(job_id = %job.id, status = %job.status, "Stored job already terminal"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to store job status"),
        }
    }
}

/// Parse each output line and queue the resulting entries.
async fn pump_output(
    job_id: JobId,
    mut lines: mpsc::Receiver<String>,
    logs: Arc<LogStore>,
    content_cap: usize,
) {
    let mut parser = EventStreamParser::new(content_cap);
    while let Some(line) = lines.recv().await {
        let entries = parser.parse_line(&line);
        logs.append(job_id, entries).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tokio::sync::broadcast;

    use super::*;
    use crate::config::{AgentCommandConfig, LogStoreConfig};
    use crate::delivery::hub::JobNotice;
    use crate::jobs::model::JobType;
    use crate::store::libsql_backend::LibSqlJobStore;

    struct Harness {
        scheduler: Arc<JobScheduler>,
        store: Arc<dyn JobStore>,
        notices: broadcast::Receiver<JobNotice>,
    }

    async fn harness(script: &str, max_concurrent: usize, queue_timeout: Duration) -> Harness {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let hub = EventHub::new();
        let notices = hub.subscribe();
        let config = EngineConfig {
            max_concurrent_jobs: max_concurrent,
            queue_timeout,
            kill_grace: Duration::from_millis(300),
            agent: AgentCommandConfig {
                program: "sh".into(),
                leading_args: vec!["-c".into(), script.into(), "fake-agent".into()],
                model: None,
            },
            log_store: LogStoreConfig {
                flush_interval: Duration::from_millis(20),
                ..LogStoreConfig::default()
            },
            ..EngineConfig::default()
        };
        let logs = Arc::new(LogStore::new(
            Arc::clone(&store),
            hub.clone(),
            config.log_store.clone(),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            config,
            "test-instance",
            Arc::clone(&store),
            Arc::new(JobRegistry::new()),
            logs,
            hub,
        ));
        Harness {
            scheduler,
            store,
            notices,
        }
    }

    async fn wait_finished(rx: &mut broadcast::Receiver<JobNotice>, id: JobId) -> JobStatus {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let JobNotice::Finished { job_id, status, .. } = rx.recv().await.unwrap()
                    && job_id == id
                {
                    return status;
                }
            }
        })
        .await
        .expect("job did not finish")
    }

    fn research(entity: &str) -> JobSpec {
        JobSpec::new(JobType::EntityResearch, entity)
    }

    #[tokio::test]
    async fn successful_run_persists_logs_and_status() {
        let mut h = harness(
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Found the CTO"}]}}'; echo 'Fetching https://acme.test'"#,
            2,
            Duration::from_secs(5),
        )
        .await;

        let id = h.scheduler.start(research("acme")).await.unwrap();
        assert_eq!(wait_finished(&mut h.notices, id).await, JobStatus::Completed);

        let job = h.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());

        let entries = h.store.read_log_entries(id, 0).await.unwrap();
        let kinds: Vec<LogKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds[0], LogKind::System);
        assert!(kinds.contains(&LogKind::Assistant));
        assert!(kinds.contains(&LogKind::Progress));
        assert!(entries.iter().any(|e| e.content == "Found the CTO"));
        assert!(h.scheduler.active_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let mut h = harness("exit 3", 2, Duration::from_secs(5)).await;
        let id = h.scheduler.start(research("acme")).await.unwrap();
        assert_eq!(wait_finished(&mut h.notices, id).await, JobStatus::Error);

        let job = h.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.exit_reason.as_deref(), Some("Exited with code 3"));
    }

    #[tokio::test]
    async fn per_job_timeout_ends_in_timeout() {
        let mut h = harness("trap '' TERM; sleep 30", 2, Duration::from_secs(5)).await;
        let spec = research("slow").with_timeout_secs(1);
        let id = h.scheduler.start(spec).await.unwrap();
        assert_eq!(wait_finished(&mut h.notices, id).await, JobStatus::Timeout);
        assert_eq!(h.scheduler.running_count(), 0);
    }

    #[tokio::test]
    async fn kill_is_reported_once() {
        let mut h = harness("echo started; sleep 30", 2, Duration::from_secs(5)).await;
        let id = h.scheduler.start(research("acme")).await.unwrap();

        // Wait until the job is actually running.
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.scheduler.running_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        h.scheduler.kill(id).await.unwrap();
        assert!(matches!(
            h.scheduler.kill(id).await,
            Err(JobError::NotFound { .. })
        ));
        assert_eq!(wait_finished(&mut h.notices, id).await, JobStatus::Killed);
        assert!(matches!(
            h.scheduler.kill(id).await,
            Err(JobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn queue_timeout_never_spawns() {
        let mut h = harness("sleep 30", 1, Duration::from_millis(200)).await;
        let first = h.scheduler.start(research("first")).await.unwrap();
        let second = h.scheduler.start(research("second")).await.unwrap();

        assert_eq!(wait_finished(&mut h.notices, second).await, JobStatus::Timeout);
        let job = h.store.get_job(second).await.unwrap().unwrap();
        assert!(job.started_at.is_none());
        let entries = h.store.read_log_entries(second, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LogKind::Error);

        h.scheduler.kill(first).await.unwrap();
        assert_eq!(wait_finished(&mut h.notices, first).await, JobStatus::Killed);
    }

    #[tokio::test]
    async fn killing_a_queued_job_skips_the_spawn() {
        let mut h = harness("sleep 30", 1, Duration::from_secs(30)).await;
        let first = h.scheduler.start(research("first")).await.unwrap();
        let second = h.scheduler.start(research("second")).await.unwrap();

        h.scheduler.kill(second).await.unwrap();
        assert_eq!(wait_finished(&mut h.notices, second).await, JobStatus::Killed);
        let job = h.store.get_job(second).await.unwrap().unwrap();
        assert!(job.started_at.is_none());
        assert_eq!(job.exit_reason.as_deref(), Some("Killed while queued"));

        h.scheduler.shutdown().await;
        let job = h.store.get_job(first).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Killed);
    }

    #[tokio::test]
    async fn missing_agent_fails_synchronously() {
        let h = harness("exit 0", 1, Duration::from_secs(1)).await;
        let mut config = h.scheduler.config.clone();
        config.agent.program = "/nonexistent/research-agent".into();
        let scheduler = Arc::new(JobScheduler::new(
            config,
            "test-instance",
            Arc::clone(&h.store),
            Arc::new(JobRegistry::new()),
            Arc::clone(&h.scheduler.logs),
            EventHub::new(),
        ));

        let err = scheduler.start(research("acme")).await.unwrap_err();
        assert!(matches!(err, JobError::ProcessNotFound { .. }));
        assert!(scheduler.active_jobs().await.is_empty());
    }
}
