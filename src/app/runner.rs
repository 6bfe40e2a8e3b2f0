use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::app::dispatcher::Broadcaster;
use crate::app::handlers::HandlerRegistry;
use crate::app::job_store::JobStore;
use crate::app::model::{Job, JobStatus, ProgressEvent};
use crate::progress::Progress;

/// Everything a handler gets for one job.
pub struct JobContext {
    pub job: Job,
    pub cancel: CancellationToken,
    work_dir: PathBuf,
    reporter: ProgressReporter,
}

impl JobContext {
    /// Scratch directory of this job; removed once the job finishes.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn progress(&self) -> &dyn Progress {
        &self.reporter
    }

    /// Fails once the job was cancelled. Handlers call this between steps that
    /// leave nothing to undo.
    pub fn ensure_active(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("job cancelled");
        }
        Ok(())
    }

    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.job.payload.clone())
            .with_context(|| format!("invalid {} payload", self.job.kind))
    }
}

/// Persists progress, then fans it out to the job's subscribers.
///
/// A job that stopped running elsewhere (cancelled from another process) trips the
/// job's cancellation token on the next report.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    store: Arc<dyn JobStore>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
}

#[async_trait]
impl Progress for ProgressReporter {
    async fn report(&self, percent: u8, message: &str) {
        self.report_details(percent, message, None, None).await;
    }

    async fn report_details(
        &self,
        percent: u8,
        message: &str,
        metadata: Option<serde_json::Value>,
        metrics: Option<serde_json::Value>,
    ) {
        let percent = percent.min(100);
        match self.store.update_progress(&self.job_id, percent, message).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %self.job_id, "progress for a job that is no longer running");
                self.cancel.cancel();
                return;
            }
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %format!("{err:#}"), "persist progress");
            }
        }
        if let Some(metrics) = &metrics {
            self.broadcaster.merge_metrics(&self.job_id, metrics);
        }
        let mut event = ProgressEvent::progress(&self.job_id, percent, message);
        event.metadata = metadata;
        event.metrics = metrics;
        self.broadcaster.publish(&event);
    }
}

pub struct JobRunner {
    store: Arc<dyn JobStore>,
    handlers: HandlerRegistry,
    broadcaster: Arc<Broadcaster>,
    work_root: PathBuf,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: HandlerRegistry,
        broadcaster: Arc<Broadcaster>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            handlers,
            broadcaster,
            work_root: work_root.into(),
        }
    }

    /// Runs a job already claimed (status `running`) to a terminal status.
    pub async fn run_job(&self, job: Job, cancel: CancellationToken) {
        let job_id = job.id.clone();
        let kind = job.kind;
        let work_dir = default_job_work_dir(&self.work_root, &job_id);

        let outcome = self.try_run_job(job, cancel, &work_dir).await;
        if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(job_id, path = %work_dir.display(), ?err, "remove work dir");
        }

        match outcome {
            Ok(result) => {
                if let Err(err) = self.mark_completed(&job_id, &result).await {
                    tracing::error!(job_id, error = %format!("{err:#}"), "record job completion");
                    if let Err(err) = self.mark_error(&job_id, format!("{err:#}")).await {
                        tracing::error!(job_id, error = %format!("{err:#}"), "record job failure");
                    }
                }
            }
            Err(err) => {
                tracing::error!(job_id, %kind, error = %format!("{err:#}"), "job failed");
                if let Err(err) = self.mark_error(&job_id, format!("{err:#}")).await {
                    tracing::error!(job_id, error = %format!("{err:#}"), "record job failure");
                }
            }
        }
    }

    async fn try_run_job(
        &self,
        job: Job,
        cancel: CancellationToken,
        work_dir: &Path,
    ) -> anyhow::Result<serde_json::Value> {
        let handler = self
            .handlers
            .get(job.kind)
            .ok_or_else(|| anyhow::anyhow!("no handler registered for {}", job.kind))?;

        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("create work dir: {}", work_dir.display()))?;

        let reporter = ProgressReporter {
            job_id: job.id.clone(),
            store: Arc::clone(&self.store),
            broadcaster: Arc::clone(&self.broadcaster),
            cancel: cancel.clone(),
        };
        let ctx = JobContext {
            job,
            cancel,
            work_dir: work_dir.to_path_buf(),
            reporter,
        };

        tracing::info!(job_id = %ctx.job.id, kind = %ctx.job.kind, "job started");
        self.broadcaster
            .publish(&ProgressEvent::progress(&ctx.job.id, 0, "started"));

        // Handlers observe `ctx.cancel` at their own safe points and clean up
        // before returning; the runner never drops them mid-flight.
        handler.handle(&ctx).await
    }

    async fn mark_completed(&self, job_id: &str, result: &serde_json::Value) -> anyhow::Result<()> {
        if !self.store.complete(job_id, result).await.context("complete job")? {
            tracing::info!(job_id, "job finished after leaving running; result dropped");
            return self.close_stale(job_id).await;
        }
        tracing::info!(job_id, "job completed");
        self.publish_final(job_id).await
    }

    async fn mark_error(&self, job_id: &str, message: String) -> anyhow::Result<()> {
        if !self.store.fail(job_id, &message).await.context("fail job")? {
            return self.close_stale(job_id).await;
        }
        self.publish_final(job_id).await
    }

    /// The job reached a terminal status elsewhere. Remaining subscribers get its
    /// stored state as their last event.
    async fn close_stale(&self, job_id: &str) -> anyhow::Result<()> {
        if let Some(job) = self.store.get(job_id).await.context("load job")? {
            self.broadcaster.publish(&ProgressEvent::from_job(&job));
        }
        self.broadcaster.forget(job_id);
        Ok(())
    }

    async fn publish_final(&self, job_id: &str) -> anyhow::Result<()> {
        let job = self
            .store
            .get(job_id)
            .await
            .context("load job")?
            .ok_or_else(|| anyhow::anyhow!("job not found: {job_id}"))?;
        debug_assert!(matches!(job.status, JobStatus::Completed | JobStatus::Failed));
        self.broadcaster.finish(&job);
        Ok(())
    }
}

pub fn default_job_work_dir(base_dir: &Path, job_id: &str) -> PathBuf {
    base_dir.join("work").join(job_id)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::app::handlers::JobHandler;
    use crate::app::job_store::SqliteJobStore;
    use crate::app::model::JobKind;
    use crate::db;

    /// Accepts everything except recording a final outcome.
    struct Unrecordable(SqliteJobStore);

    #[async_trait]
    impl JobStore for Unrecordable {
        async fn insert(&self, job: &Job) -> anyhow::Result<()> {
            self.0.insert(job).await
        }
        async fn get(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
            self.0.get(job_id).await
        }
        async fn list(&self, status: Option<JobStatus>, limit: u32) -> anyhow::Result<Vec<Job>> {
            self.0.list(status, limit).await
        }
        async fn claim_next(&self) -> anyhow::Result<Option<Job>> {
            self.0.claim_next().await
        }
        async fn update_progress(
            &self,
            job_id: &str,
            percent: u8,
            message: &str,
        ) -> anyhow::Result<bool> {
            self.0.update_progress(job_id, percent, message).await
        }
        async fn complete(&self, _job_id: &str, _result: &serde_json::Value) -> anyhow::Result<bool> {
            anyhow::bail!("disk full")
        }
        async fn fail(&self, _job_id: &str, _error: &str) -> anyhow::Result<bool> {
            anyhow::bail!("disk full")
        }
        async fn cancel(&self, job_id: &str) -> anyhow::Result<bool> {
            self.0.cancel(job_id).await
        }
        async fn recover_interrupted(&self) -> anyhow::Result<u64> {
            self.0.recover_interrupted().await
        }
    }

    struct Done;

    #[async_trait]
    impl JobHandler for Done {
        async fn handle(&self, _ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn unrecordable_outcome_leaves_job_running_for_recovery() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store: Arc<dyn JobStore> = Arc::new(Unrecordable(SqliteJobStore::new(db::in_memory().await?)));
        let mut handlers = HandlerRegistry::new();
        handlers.register(JobKind::TranscribeMedia, Done);
        let broadcaster = Arc::new(Broadcaster::new(8));
        let runner = JobRunner::new(Arc::clone(&store), handlers, Arc::clone(&broadcaster), dir.path());

        store.insert(&Job::new(JobKind::TranscribeMedia, json!({}))).await?;
        let job = store.claim_next().await?.expect("claim");
        let mut subscription = broadcaster.subscribe(&job.id);
        runner.run_job(job.clone(), CancellationToken::new()).await;

        assert!(!default_job_work_dir(dir.path(), &job.id).exists());
        let stored = store.get(&job.id).await?.expect("job");
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(store.recover_interrupted().await?, 1);

        let started = subscription.events.try_recv()?;
        assert_eq!(started.message, "started");
        assert!(subscription.events.try_recv().is_err());
        Ok(())
    }
}
