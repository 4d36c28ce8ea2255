//! Per-job event subscriptions with catch-up and live updates.
//!
//! A subscription starts from the caller's last-seen sequence number, replays
//! stored entries, then follows the job through hub notices with a poll tick
//! as fallback. It always re-reads the store after the last delivered
//! sequence, so a reconnect never duplicates or skips an entry. `complete`
//! is emitted once, after every entry, and ends the subscription.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::delivery::hub::{EventHub, JobNotice};
use crate::error::{Error, JobError};
use crate::jobs::model::{JobId, JobStatus};
use crate::store::traits::JobStore;
use crate::stream::entry::LogEntry;

/// One event on a job's delivery stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    Log { entry: LogEntry },
    /// Terminal; nothing follows.
    Complete { status: JobStatus, message: String },
    /// A transient failure; the stream keeps going.
    Error { message: String },
}

/// Opens subscriptions.
#[derive(Clone)]
pub struct EventDelivery {
    store: Arc<dyn JobStore>,
    hub: EventHub,
    poll_interval: Duration,
}

impl EventDelivery {
    pub fn new(store: Arc<dyn JobStore>, hub: EventHub, poll_interval: Duration) -> Self {
        Self {
            store,
            hub,
            poll_interval,
        }
    }

    /// Follow `job_id` starting after `after_seq` (0 for everything).
    pub async fn subscribe(&self, job_id: JobId, after_seq: i64) -> Result<Subscription, Error> {
        // Subscribe before the first read so no notice falls in between.
        let notices = self.hub.subscribe();
        if self.store.get_job(job_id).await?.is_none() {
            return Err(JobError::NotFound { id: job_id }.into());
        }

        let mut poll = tokio::time::interval_at(
            Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(job_id = %job_id, after_seq, "Subscription opened");
        Ok(Subscription {
            job_id,
            store: Arc::clone(&self.store),
            notices,
            hub_closed: false,
            poll,
            last_seq: after_seq.max(0),
            pending: VecDeque::new(),
            finished: None,
            phase: Phase::Streaming,
            wait_before_read: false,
        })
    }
}

enum Phase {
    Streaming,
    /// Terminal status seen; drain `pending`, then emit `complete`.
    Finishing { status: JobStatus, message: String },
    Done,
}

/// A live event stream for one job.
pub struct Subscription {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    notices: broadcast::Receiver<JobNotice>,
    hub_closed: bool,
    poll: Interval,
    last_seq: i64,
    pending: VecDeque<LogEntry>,
    /// Completion announced by the hub, not yet acted on.
    finished: Option<(JobStatus, String)>,
    phase: Phase,
    wait_before_read: bool,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Sequence number of the last delivered entry.
    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    /// Next event, or `None` once `complete` has been delivered.
    pub async fn next(&mut self) -> Option<DeliveryEvent> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                self.last_seq = entry.seq;
                return Some(DeliveryEvent::Log { entry });
            }

            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Finishing { status, message } => {
                    debug!(job_id = %self.job_id, status = %status, "Subscription complete");
                    return Some(DeliveryEvent::Complete { status, message });
                }
                Phase::Streaming => self.phase = Phase::Streaming,
            }

            if self.wait_before_read {
                self.wait_before_read = false;
                self.wait_for_change().await;
            }

            match self.store.read_log_entries(self.job_id, self.last_seq).await {
                Ok(entries) if !entries.is_empty() => {
                    self.pending.extend(entries);
                    continue;
                }
                Ok(_) => {}
                Err(e) => return Some(self.transient_error(e.to_string())),
            }

            let terminal = match self.finished.take() {
                Some(done) => Some(done),
                None => match self.store.get_job(self.job_id).await {
                    Ok(Some(job)) if job.status.is_terminal() => Some((job.status, job.summary())),
                    Ok(Some(_)) => None,
                    Ok(None) => {
                        warn!(job_id = %self.job_id, "Job record vanished during subscription");
                        self.phase = Phase::Done;
                        return Some(DeliveryEvent::Error {
                            message: JobError::NotFound { id: self.job_id }.to_string(),
                        });
                    }
                    Err(e) => return Some(self.transient_error(e.to_string())),
                },
            };

            match terminal {
                Some((status, message)) => {
                    // Logs are flushed before the terminal status is stored,
                    // so this read sees the tail.
                    match self.store.read_log_entries(self.job_id, self.last_seq).await {
                        Ok(entries) => self.pending.extend(entries),
                        Err(e) => {
                            self.finished = Some((status, message));
                            return Some(self.transient_error(e.to_string()));
                        }
                    }
                    self.phase = Phase::Finishing { status, message };
                }
                None => self.wait_for_change().await,
            }
        }
    }

    /// Adapt into a [`Stream`] that ends after `complete`.
    pub fn into_stream(self) -> impl Stream<Item = DeliveryEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }

    fn transient_error(&mut self, message: String) -> DeliveryEvent {
        warn!(job_id = %self.job_id, error = %message, "Delivery read failed");
        self.wait_before_read = true;
        DeliveryEvent::Error { message }
    }

    /// Sleep until a relevant notice arrives or the poll tick fires.
    async fn wait_for_change(&mut self) {
        if self.hub_closed {
            self.poll.tick().await;
            return;
        }
        loop {
            tokio::select! {
                notice = self.notices.recv() => match notice {
                    Ok(JobNotice::Appended { job_id, last_seq })
                        if job_id == self.job_id && last_seq > self.last_seq => return,
                    Ok(JobNotice::Finished { job_id, status, message }) if job_id == self.job_id => {
                        self.finished = Some((status, message));
                        return;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(job_id = %self.job_id, skipped, "Subscriber lagged, re-reading");
                        return;
                    }
                    Err(RecvError::Closed) => {
                        self.hub_closed = true;
                        self.poll.tick().await;
                        return;
                    }
                },
                _ = self.poll.tick() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::config::LogStoreConfig;
    use crate::jobs::model::{Job, JobOptions, JobSpec, JobType};
    use crate::store::libsql_backend::LibSqlJobStore;
    use crate::store::log_store::LogStore;
    use crate::stream::entry::{LogKind, NewLogEntry};

    struct Fixture {
        store: Arc<dyn JobStore>,
        hub: EventHub,
        delivery: EventDelivery,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let hub = EventHub::new();
        let delivery = EventDelivery::new(Arc::clone(&store), hub.clone(), Duration::from_millis(50));
        Fixture {
            store,
            hub,
            delivery,
        }
    }

    async fn running_job(store: &Arc<dyn JobStore>) -> Job {
        let mut job = Job::queued(&JobSpec::new(JobType::EntityResearch, "acme"));
        store
            .insert_job(&job, &JobOptions::default(), "test")
            .await
            .unwrap();
        job.transition_to(JobStatus::Running, None).unwrap();
        store.update_job_status(&job).await.unwrap();
        job
    }

    fn entries(n: usize) -> Vec<NewLogEntry> {
        (1..=n)
            .map(|i| NewLogEntry::new(LogKind::Assistant, format!("step {i}")))
            .collect()
    }

    async fn collect(sub: Subscription) -> Vec<DeliveryEvent> {
        tokio::time::timeout(Duration::from_secs(5), sub.into_stream().collect())
            .await
            .expect("subscription did not complete")
    }

    fn seqs(events: &[DeliveryEvent]) -> Vec<i64> {
        events
            .iter()
            .filter_map(|e| match e {
                DeliveryEvent::Log { entry } => Some(entry.seq),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn finished_job_replays_then_completes_once() {
        let f = fixture().await;
        let mut job = running_job(&f.store).await;
        f.store.append_log_entries(job.id, 1, &entries(3)).await.unwrap();
        job.transition_to(JobStatus::Completed, None).unwrap();
        f.store.update_job_status(&job).await.unwrap();

        let events = collect(f.delivery.subscribe(job.id, 0).await.unwrap()).await;
        assert_eq!(seqs(&events), vec![1, 2, 3]);
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events.last(),
            Some(DeliveryEvent::Complete {
                status: JobStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn resuming_from_last_seen_skips_nothing() {
        let f = fixture().await;
        let mut job = running_job(&f.store).await;
        f.store.append_log_entries(job.id, 1, &entries(5)).await.unwrap();
        job.transition_to(JobStatus::Error, Some("Exited with code 1".into()))
            .unwrap();
        f.store.update_job_status(&job).await.unwrap();

        // First connection drops after two entries.
        let mut first = f.delivery.subscribe(job.id, 0).await.unwrap();
        first.next().await.unwrap();
        first.next().await.unwrap();
        let resume_at = first.last_seq();
        drop(first);

        let events = collect(f.delivery.subscribe(job.id, resume_at).await.unwrap()).await;
        assert_eq!(seqs(&events), vec![3, 4, 5]);
        let completes = events
            .iter()
            .filter(|e| matches!(e, DeliveryEvent::Complete { .. }))
            .count();
        assert_eq!(completes, 1);
    }

    #[tokio::test]
    async fn follows_a_live_job_to_completion() {
        let f = fixture().await;
        let mut job = running_job(&f.store).await;
        let sub = f.delivery.subscribe(job.id, 0).await.unwrap();
        let reader = tokio::spawn(collect(sub));

        let logs = LogStore::new(
            Arc::clone(&f.store),
            f.hub.clone(),
            LogStoreConfig {
                flush_threshold: 2,
                ..LogStoreConfig::default()
            },
        );
        for chunk in 0..5 {
            logs.append(job.id, entries(3)).await;
            if chunk % 2 == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        logs.finish(job.id).await;
        job.transition_to(JobStatus::Completed, None).unwrap();
        f.store.update_job_status(&job).await.unwrap();
        f.hub.notify_finished(job.id, JobStatus::Completed, job.summary());

        let events = reader.await.unwrap();
        assert_eq!(seqs(&events), (1..=15).collect::<Vec<_>>());
        assert_eq!(
            events.last(),
            Some(&DeliveryEvent::Complete {
                status: JobStatus::Completed,
                message: job.summary(),
            })
        );
    }

    #[tokio::test]
    async fn same_resume_point_yields_same_entries() {
        let f = fixture().await;
        let mut job = running_job(&f.store).await;
        let logs = LogStore::new(
            Arc::clone(&f.store),
            f.hub.clone(),
            LogStoreConfig {
                flush_threshold: 2,
                ..LogStoreConfig::default()
            },
        );
        logs.append(job.id, entries(4)).await;

        // Both attach mid-run at the same point while appends continue.
        let a = tokio::spawn(collect(f.delivery.subscribe(job.id, 2).await.unwrap()));
        let b = tokio::spawn(collect(f.delivery.subscribe(job.id, 2).await.unwrap()));
        for _ in 0..4 {
            logs.append(job.id, entries(3)).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        logs.finish(job.id).await;
        job.transition_to(JobStatus::Completed, None).unwrap();
        f.store.update_job_status(&job).await.unwrap();
        f.hub.notify_finished(job.id, JobStatus::Completed, job.summary());

        let expected: Vec<i64> = (3..=16).collect();
        let live_a = seqs(&a.await.unwrap());
        let live_b = seqs(&b.await.unwrap());
        assert_eq!(live_a, expected);
        assert_eq!(live_b, expected);

        // And again once the job is over.
        let after_a = seqs(&collect(f.delivery.subscribe(job.id, 2).await.unwrap()).await);
        let after_b = seqs(&collect(f.delivery.subscribe(job.id, 2).await.unwrap()).await);
        assert_eq!(after_a, expected);
        assert_eq!(after_b, expected);
    }

    #[tokio::test]
    async fn poll_fallback_catches_missed_notices() {
        let f = fixture().await;
        let mut job = running_job(&f.store).await;
        let sub = f.delivery.subscribe(job.id, 0).await.unwrap();
        let reader = tokio::spawn(collect(sub));

        // Written behind the hub's back.
        f.store.append_log_entries(job.id, 1, &entries(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        job.transition_to(JobStatus::Killed, Some("Killed by request".into()))
            .unwrap();
        f.store.update_job_status(&job).await.unwrap();

        let events = reader.await.unwrap();
        assert_eq!(seqs(&events), vec![1, 2]);
        assert!(matches!(
            events.last(),
            Some(DeliveryEvent::Complete {
                status: JobStatus::Killed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let f = fixture().await;
        let result = f.delivery.subscribe(uuid::Uuid::new_v4(), 0).await;
        assert!(matches!(result, Err(Error::Job(JobError::NotFound { .. }))));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(DeliveryEvent::Complete {
            status: JobStatus::Timeout,
            message: "entity-research for acme timed out".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["status"], "timeout");
    }
}
