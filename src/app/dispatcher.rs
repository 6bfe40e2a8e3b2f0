use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::app::job_store::JobStore;
use crate::app::model::{Job, JobKind, JobStatus, ProgressEvent};
use crate::app::runner::JobRunner;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    /// Events buffered per subscriber before new ones are dropped.
    pub subscriber_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(1),
            subscriber_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dropped_events: u64,
}

/// A live view of one job's progress events. Ends after the job's terminal event.
pub struct Subscription {
    pub id: u64,
    pub job_id: String,
    pub events: mpsc::Receiver<ProgressEvent>,
}

#[derive(Default)]
struct BroadcastState {
    next_id: u64,
    subscribers: HashMap<String, Vec<(u64, mpsc::Sender<ProgressEvent>)>>,
    /// Metrics reported by running jobs, merged key by key.
    metrics: HashMap<String, serde_json::Map<String, serde_json::Value>>,
    stats: DispatcherStats,
}

/// Subscriber registry and per-job metrics, behind one lock.
///
/// Delivery never blocks: a subscriber whose buffer is full misses the event.
pub struct Broadcaster {
    buffer: usize,
    state: Mutex<BroadcastState>,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            state: Mutex::new(BroadcastState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, job_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state
            .subscribers
            .entry(job_id.to_owned())
            .or_default()
            .push((id, tx));
        Subscription {
            id,
            job_id: job_id.to_owned(),
            events: rx,
        }
    }

    pub fn unsubscribe(&self, job_id: &str, subscription_id: u64) {
        let mut state = self.lock();
        if let Some(senders) = state.subscribers.get_mut(job_id) {
            senders.retain(|(id, _)| *id != subscription_id);
            if senders.is_empty() {
                state.subscribers.remove(job_id);
            }
        }
    }

    pub fn publish(&self, event: &ProgressEvent) {
        let mut state = self.lock();
        let Some(senders) = state.subscribers.get_mut(&event.job_id) else {
            return;
        };
        let mut dropped = 0;
        senders.retain(|(_, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            state.subscribers.remove(&event.job_id);
        }
        if dropped > 0 {
            tracing::debug!(job_id = %event.job_id, dropped, "subscriber buffer full; event dropped");
            state.stats.dropped_events += dropped;
        }
    }

    pub fn merge_metrics(&self, job_id: &str, metrics: &serde_json::Value) {
        let mut state = self.lock();
        let entry = state.metrics.entry(job_id.to_owned()).or_default();
        match metrics {
            serde_json::Value::Object(map) => {
                entry.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            other => {
                entry.insert("value".to_owned(), other.clone());
            }
        }
    }

    /// Metrics accumulated so far for a running job.
    pub fn metrics(&self, job_id: &str) -> Option<serde_json::Value> {
        self.lock()
            .metrics
            .get(job_id)
            .map(|m| serde_json::Value::Object(m.clone()))
    }

    /// Publishes a job's terminal event and closes its subscriptions.
    pub fn finish(&self, job: &Job) {
        let mut event = ProgressEvent::from_job(job);
        {
            let mut state = self.lock();
            event.metrics = state
                .metrics
                .remove(&job.id)
                .map(serde_json::Value::Object);
            match job.status {
                JobStatus::Completed => state.stats.completed += 1,
                JobStatus::Failed => state.stats.failed += 1,
                JobStatus::Cancelled => state.stats.cancelled += 1,
                JobStatus::Pending | JobStatus::Running => {}
            }
        }
        self.publish(&event);
        self.forget(&job.id);
    }

    /// Drops subscribers and metrics of a job without another event.
    pub fn forget(&self, job_id: &str) {
        let mut state = self.lock();
        state.subscribers.remove(job_id);
        state.metrics.remove(job_id);
    }

    fn record_claim(&self) {
        self.lock().stats.claimed += 1;
    }

    pub fn stats(&self) -> DispatcherStats {
        self.lock().stats
    }
}

/// Polls the job store with a fixed pool of workers. Each idle worker claims at
/// most one job per attempt and runs it to completion before claiming again.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    broadcaster: Arc<Broadcaster>,
    config: DispatcherConfig,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<JobRunner>,
        broadcaster: Arc<Broadcaster>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            runner,
            broadcaster,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub async fn enqueue(&self, kind: JobKind, payload: serde_json::Value) -> anyhow::Result<String> {
        let job = Job::new(kind, payload);
        self.store.insert(&job).await.context("enqueue job")?;
        tracing::info!(job_id = %job.id, %kind, "job enqueued");
        Ok(job.id)
    }

    pub fn subscribe(&self, job_id: &str) -> Subscription {
        self.broadcaster.subscribe(job_id)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.broadcaster
            .unsubscribe(&subscription.job_id, subscription.id);
    }

    /// Marks a pending or running job cancelled. A job running in this process is
    /// also signalled through its cancellation token; its handler stops at its next
    /// safe point and its late result is dropped.
    ///
    /// Returns `false` when the job is unknown or already terminal.
    pub async fn cancel(&self, job_id: &str) -> anyhow::Result<bool> {
        if !self.store.cancel(job_id).await? {
            return Ok(false);
        }
        tracing::info!(job_id, "job cancelled");
        // Subscribers get the terminal event before the handler winds down.
        if let Some(job) = self.store.get(job_id).await? {
            self.broadcaster.finish(&job);
        }
        let token = self.running_jobs().get(job_id).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(true)
    }

    /// Claims and runs at most one job. Returns whether a job ran.
    pub async fn tick_once(&self, shutdown: &CancellationToken) -> anyhow::Result<bool> {
        let Some(job) = self.store.claim_next().await.context("claim job")? else {
            return Ok(false);
        };
        self.broadcaster.record_claim();

        let job_id = job.id.clone();
        let token = shutdown.child_token();
        self.running_jobs()
            .insert(job_id.clone(), token.clone());
        self.runner.run_job(job, token).await;
        self.running_jobs().remove(&job_id);
        Ok(true)
    }

    fn running_jobs(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs the worker pool until `shutdown` fires. Jobs in flight at shutdown are
    /// signalled and awaited.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let workers = self.config.workers.max(1);
        tracing::info!(
            workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher starting"
        );

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let dispatcher = Arc::clone(&self);
            let shutdown = shutdown.clone();
            pool.spawn(async move { dispatcher.worker_loop(worker, shutdown).await });
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                tracing::error!(?err, "worker task panicked");
            }
        }

        tracing::info!(stats = ?self.broadcaster.stats(), "dispatcher stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker: usize, shutdown: CancellationToken) {
        tracing::debug!(worker, "worker started");
        while !shutdown.is_cancelled() {
            let idle = match self.tick_once(&shutdown).await {
                Ok(ran) => !ran,
                Err(err) => {
                    tracing::error!(worker, error = %format!("{err:#}"), "worker tick failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        tracing::debug!(worker, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn full_subscribers_miss_events_without_blocking() {
        let broadcaster = Broadcaster::new(1);
        let mut slow = broadcaster.subscribe("job");
        broadcaster.publish(&ProgressEvent::progress("job", 10, "one"));
        broadcaster.publish(&ProgressEvent::progress("job", 20, "two"));

        assert_eq!(slow.events.recv().await.map(|e| e.percent), Some(10));
        assert_eq!(broadcaster.stats().dropped_events, 1);

        broadcaster.publish(&ProgressEvent::progress("job", 30, "three"));
        assert_eq!(slow.events.recv().await.map(|e| e.percent), Some(30));
    }

    #[tokio::test]
    async fn finish_closes_subscriptions_with_metrics() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.subscribe("job");
        let other = broadcaster.subscribe("job");
        broadcaster.unsubscribe("job", other.id);

        broadcaster.merge_metrics("job", &json!({"calls": 1}));
        broadcaster.merge_metrics("job", &json!({"calls": 2, "pages": 4}));

        let mut job = Job::new(JobKind::BuildMaterial, json!({}));
        job.id = "job".to_owned();
        job.status = JobStatus::Completed;
        broadcaster.finish(&job);

        let event = sub.events.recv().await.expect("terminal event");
        assert_eq!(event.status, JobStatus::Completed);
        assert_eq!(event.metrics, Some(json!({"calls": 2, "pages": 4})));
        assert!(sub.events.recv().await.is_none());
        assert!(broadcaster.metrics("job").is_none());
        assert_eq!(broadcaster.stats().completed, 1);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let broadcaster = Broadcaster::new(4);
        drop(broadcaster.subscribe("job"));
        broadcaster.publish(&ProgressEvent::progress("job", 1, "x"));
        assert!(broadcaster.lock().subscribers.is_empty());
    }
}
