use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lectern::app::dispatcher::DispatcherConfig;
use lectern::app::{
    Broadcaster, Dispatcher, HandlerRegistry, JobContext, JobHandler, JobKind, JobRunner,
    JobStatus, JobStore, ProgressEvent, SqliteJobStore,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Records which job ids it ran.
struct Recording {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobHandler for Recording {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.seen.lock().expect("lock").push(ctx.job.id.clone());
        Ok(json!({ "n": ctx.job.payload["n"] }))
    }
}

/// Reports twice with metrics, touches its work dir, then succeeds.
struct Reporting;

#[async_trait]
impl JobHandler for Reporting {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        tokio::fs::write(ctx.work_dir().join("scratch.txt"), "x").await?;
        ctx.progress()
            .report_details(40, "halfway", Some(json!({"step": 1})), Some(json!({"tokens": 5})))
            .await;
        ctx.progress()
            .report_details(80, "almost", None, Some(json!({"cost": 0.25})))
            .await;
        Ok(json!({ "work_dir": ctx.work_dir() }))
    }
}

struct Failing;

#[async_trait]
impl JobHandler for Failing {
    async fn handle(&self, _ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("transcriber exploded")
    }
}

/// Leaves a partial file outside its work dir, waits to be cancelled, then
/// removes the file before returning.
struct SelfCleaning {
    partial: std::path::PathBuf,
    started: Arc<tokio::sync::Notify>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl JobHandler for SelfCleaning {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        tokio::fs::write(&self.partial, "partial").await?;
        self.started.notify_one();
        tokio::time::timeout(Duration::from_secs(5), ctx.cancel.cancelled()).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::fs::remove_file(&self.partial).await?;
        self.finished.store(true, Ordering::SeqCst);
        Ok(json!({ "late": true }))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    data_dir: std::path::PathBuf,
    database_url: String,
    store: Arc<SqliteJobStore>,
}

impl Harness {
    async fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let database_url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let pool = lectern::db::connect(&database_url, 4).await?;
        Ok(Self {
            data_dir: dir.path().join("data"),
            _dir: dir,
            database_url,
            store: Arc::new(SqliteJobStore::new(pool)),
        })
    }

    /// A dispatcher with its own connection pool, like a separate worker process.
    async fn dispatcher(
        &self,
        handlers: HandlerRegistry,
        workers: usize,
    ) -> anyhow::Result<Arc<Dispatcher>> {
        let pool = lectern::db::connect(&self.database_url, workers as u32 + 1).await?;
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(pool));
        let broadcaster = Arc::new(Broadcaster::new(16));
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            handlers,
            Arc::clone(&broadcaster),
            &self.data_dir,
        ));
        Ok(Arc::new(Dispatcher::new(
            store,
            runner,
            broadcaster,
            DispatcherConfig {
                workers,
                poll_interval: Duration::from_millis(10),
                subscriber_buffer: 16,
            },
        )))
    }
}

fn registry(kind: JobKind, handler: impl JobHandler + 'static) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(kind, handler);
    registry
}

async fn drain(mut events: tokio::sync::mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        out.push(event);
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_job_runs_exactly_once_across_worker_pools() -> anyhow::Result<()> {
    let harness = Harness::new().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for n in 0..24 {
        let job = lectern::app::Job::new(JobKind::TranscribeMedia, json!({ "n": n }));
        harness.store.insert(&job).await?;
        ids.push(job.id);
    }

    let shutdown = CancellationToken::new();
    let mut pools = Vec::new();
    for _ in 0..2 {
        let dispatcher = harness
            .dispatcher(
                registry(
                    JobKind::TranscribeMedia,
                    Recording {
                        seen: Arc::clone(&seen),
                    },
                ),
                3,
            )
            .await?;
        pools.push(tokio::spawn(dispatcher.run(shutdown.clone())));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let completed = harness.store.list(Some(JobStatus::Completed), 100).await?;
        if completed.len() == ids.len() {
            break;
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "only {} of {} jobs completed",
            completed.len(),
            ids.len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();
    for pool in pools {
        pool.await??;
    }

    let mut runs: HashMap<String, usize> = HashMap::new();
    for id in seen.lock().expect("lock").iter() {
        *runs.entry(id.clone()).or_default() += 1;
    }
    assert_eq!(runs.len(), ids.len());
    assert!(runs.values().all(|&count| count == 1));

    let job = harness
        .store
        .get(&ids[7])
        .await?
        .ok_or_else(|| anyhow::anyhow!("job missing"))?;
    assert_eq!(job.result, Some(json!({ "n": 7 })));
    assert_eq!(job.progress, 100);
    Ok(())
}

#[tokio::test]
async fn subscribers_see_progress_then_a_terminal_event_with_merged_metrics() -> anyhow::Result<()> {
    let harness = Harness::new().await?;
    let dispatcher = harness
        .dispatcher(registry(JobKind::BuildMaterial, Reporting), 1)
        .await?;
    let job_id = dispatcher.enqueue(JobKind::BuildMaterial, json!({})).await?;
    let subscription = dispatcher.subscribe(&job_id);

    assert!(dispatcher.tick_once(&CancellationToken::new()).await?);
    let events = drain(subscription.events).await;

    let messages = events.iter().map(|e| e.message.as_str()).collect::<Vec<_>>();
    assert_eq!(messages, vec!["started", "halfway", "almost", "almost"]);
    assert_eq!(events[1].metadata, Some(json!({"step": 1})));

    let last = events.last().ok_or_else(|| anyhow::anyhow!("no events"))?;
    assert_eq!(last.status, JobStatus::Completed);
    assert_eq!(last.percent, 100);
    assert_eq!(last.metrics, Some(json!({"tokens": 5, "cost": 0.25})));

    let work_dir = last
        .result
        .as_ref()
        .and_then(|r| r["work_dir"].as_str())
        .ok_or_else(|| anyhow::anyhow!("result lacks work_dir"))?;
    assert!(!std::path::Path::new(work_dir).exists());
    assert!(dispatcher.broadcaster().metrics(&job_id).is_none());
    assert_eq!(dispatcher.broadcaster().stats().completed, 1);
    Ok(())
}

#[tokio::test]
async fn handler_errors_fail_the_job() -> anyhow::Result<()> {
    let harness = Harness::new().await?;
    let dispatcher = harness
        .dispatcher(registry(JobKind::TranscribeMedia, Failing), 1)
        .await?;
    let job_id = dispatcher.enqueue(JobKind::TranscribeMedia, json!({})).await?;
    let subscription = dispatcher.subscribe(&job_id);

    assert!(dispatcher.tick_once(&CancellationToken::new()).await?);

    let job = harness
        .store
        .get(&job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job missing"))?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("transcriber exploded"));
    assert!(job.completed_at.is_some());

    let events = drain(subscription.events).await;
    let last = events.last().ok_or_else(|| anyhow::anyhow!("no events"))?;
    assert_eq!(last.status, JobStatus::Failed);
    assert_eq!(last.error.as_deref(), Some("transcriber exploded"));
    Ok(())
}

#[tokio::test]
async fn jobs_without_a_handler_fail() -> anyhow::Result<()> {
    let harness = Harness::new().await?;
    let dispatcher = harness.dispatcher(HandlerRegistry::new(), 1).await?;
    let job_id = dispatcher.enqueue(JobKind::DownloadRemote, json!({})).await?;

    assert!(dispatcher.tick_once(&CancellationToken::new()).await?);
    assert!(!dispatcher.tick_once(&CancellationToken::new()).await?);

    let job = harness
        .store
        .get(&job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job missing"))?;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap_or_default().contains("no handler registered"));
    Ok(())
}

#[tokio::test]
async fn cancelled_running_job_lets_its_handler_clean_up() -> anyhow::Result<()> {
    let harness = Harness::new().await?;
    let started = Arc::new(tokio::sync::Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    let partial = harness.data_dir.join("partial.bin");
    let dispatcher = harness
        .dispatcher(
            registry(
                JobKind::IngestDocument,
                SelfCleaning {
                    partial: partial.clone(),
                    started: Arc::clone(&started),
                    finished: Arc::clone(&finished),
                },
            ),
            1,
        )
        .await?;
    let job_id = dispatcher.enqueue(JobKind::IngestDocument, json!({})).await?;
    let subscription = dispatcher.subscribe(&job_id);

    let worker = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.tick_once(&CancellationToken::new()).await })
    };
    tokio::time::timeout(Duration::from_secs(5), started.notified()).await?;

    assert!(dispatcher.cancel(&job_id).await?);
    assert!(tokio::time::timeout(Duration::from_secs(5), worker).await???);
    assert!(!dispatcher.cancel(&job_id).await?);

    assert!(finished.load(Ordering::SeqCst));
    assert!(!partial.exists());

    let job = harness
        .store
        .get(&job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job missing"))?;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.error.is_none());
    assert!(job.result.is_none());

    let events = drain(subscription.events).await;
    let last = events.last().ok_or_else(|| anyhow::anyhow!("no events"))?;
    assert_eq!(last.status, JobStatus::Cancelled);
    assert_eq!(dispatcher.broadcaster().stats().cancelled, 1);
    assert_eq!(dispatcher.broadcaster().stats().completed, 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_pending_jobs_are_skipped() -> anyhow::Result<()> {
    let harness = Harness::new().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = harness
        .dispatcher(
            registry(
                JobKind::TranscribeMedia,
                Recording {
                    seen: Arc::clone(&seen),
                },
            ),
            1,
        )
        .await?;
    let first = dispatcher
        .enqueue(JobKind::TranscribeMedia, json!({ "n": 1 }))
        .await?;
    let second = dispatcher
        .enqueue(JobKind::TranscribeMedia, json!({ "n": 2 }))
        .await?;
    assert!(dispatcher.cancel(&first).await?);

    assert!(dispatcher.tick_once(&CancellationToken::new()).await?);
    assert!(!dispatcher.tick_once(&CancellationToken::new()).await?);
    assert_eq!(*seen.lock().expect("lock"), vec![second]);
    Ok(())
}
