//! Implementations of the CLI subcommands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::app::artifact_store::{ArtifactStore, LocalFsArtifactStore};
use crate::app::dispatcher::{Broadcaster, Dispatcher};
use crate::app::handlers::{HandlerRegistry, Services};
use crate::app::job_store::{JobStore, SqliteJobStore};
use crate::app::runner::JobRunner;
use crate::cli::{EnqueueArgs, GenerateArgs, JobArgs, JobsArgs, LectureCreateArgs, WorkerArgs};
use crate::collaborators::{
    CommandTranscriber, DocumentProcessor, PlainTextDocumentProcessor, TranscriptionService,
};
use crate::config::Config;
use crate::export::{ExportAssembler, PandocConverter};
use crate::generator::{GenerationInput, ReferencePage, ToolGenerator};
use crate::library::Library;
use crate::llm::Stage;
use crate::progress::Progress;
use crate::db;

/// Wires the store, handlers and worker pool from configuration.
pub async fn build_dispatcher(config: &Config) -> anyhow::Result<Arc<Dispatcher>> {
    let pool = db::connect(&config.database_url, config.workers as u32 + 2).await?;
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(pool.clone()));
    let library = Library::new(pool);

    let llm = config.llm_client()?;
    if llm.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; material builds will fail");
    }
    let mut artifacts = LocalFsArtifactStore::new(&config.data_dir);
    if let Some(url) = &config.public_base_url {
        artifacts = artifacts.with_public_base_url(url.clone());
    }
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(artifacts);
    let mut converter = PandocConverter::new(&config.pandoc, config.render_timeout);
    if let Some(engine) = &config.pdf_engine {
        converter = converter.with_pdf_engine(engine.clone());
    }
    let converter = Arc::new(converter);
    let mut exporter = ExportAssembler::new(library.clone(), converter, artifacts);
    let defaults = config.generation_options();
    if let Some(llm) = &llm {
        exporter = exporter.with_llm(llm.clone(), defaults.models.model(Stage::Abstract));
    }
    let transcriber = config
        .transcriber
        .as_deref()
        .map(|command| {
            CommandTranscriber::from_command_line(command, config.transcribe_timeout)
                .map(|t| Arc::new(t) as Arc<dyn TranscriptionService>)
        })
        .transpose()?;
    let documents: Arc<dyn DocumentProcessor> = Arc::new(PlainTextDocumentProcessor);

    let services = Arc::new(Services {
        library,
        jobs: Arc::clone(&store),
        generator: llm.map(ToolGenerator::new),
        generation_defaults: defaults,
        transcriber,
        documents,
        exporter,
        data_dir: config.data_dir.clone(),
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("build http client")?,
    });

    let broadcaster = Arc::new(Broadcaster::new(config.subscriber_buffer));
    let runner = Arc::new(JobRunner::new(
        Arc::clone(&store),
        HandlerRegistry::standard(services),
        Arc::clone(&broadcaster),
        &config.data_dir,
    ));
    Ok(Arc::new(Dispatcher::new(
        store,
        runner,
        broadcaster,
        config.dispatcher_config(),
    )))
}

async fn job_store(config: &Config) -> anyhow::Result<SqliteJobStore> {
    Ok(SqliteJobStore::new(db::connect(&config.database_url, 1).await?))
}

pub async fn worker(mut config: Config, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("create data dir: {}", config.data_dir.display()))?;
    let dispatcher = build_dispatcher(&config).await?;
    if args.recover {
        let store = job_store(&config).await?;
        let recovered = store.recover_interrupted().await?;
        tracing::info!(recovered, "interrupted jobs marked failed");
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        signal.cancel();
    });
    dispatcher.run(shutdown).await
}

pub async fn enqueue(config: &Config, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("parse --payload as JSON")?;
    if !payload.is_object() {
        anyhow::bail!("--payload must be a JSON object");
    }
    let store = job_store(config).await?;
    let job = crate::app::model::Job::new(args.kind, payload);
    store.insert(&job).await?;
    println!("{}", job.id);
    Ok(())
}

pub async fn status(config: &Config, args: JobArgs) -> anyhow::Result<()> {
    let store = job_store(config).await?;
    let job = store
        .get(&args.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job not found: {}", args.job_id))?;
    println!("{}", serde_json::to_string_pretty(&job).context("serialize job")?);
    Ok(())
}

pub async fn cancel(config: &Config, args: JobArgs) -> anyhow::Result<()> {
    let store = job_store(config).await?;
    if !store.cancel(&args.job_id).await? {
        anyhow::bail!("job {} is not pending or running", args.job_id);
    }
    println!("cancelled {}", args.job_id);
    Ok(())
}

pub async fn jobs(config: &Config, args: JobsArgs) -> anyhow::Result<()> {
    let store = job_store(config).await?;
    for job in store.list(args.status, args.limit).await? {
        println!(
            "{}\t{}\t{}\t{:>3}%\t{}",
            job.id,
            job.kind,
            job.status,
            job.progress,
            job.error.as_deref().unwrap_or(&job.progress_message)
        );
    }
    Ok(())
}

pub async fn lecture_create(config: &Config, args: LectureCreateArgs) -> anyhow::Result<()> {
    let library = Library::new(db::connect(&config.database_url, 1).await?);
    let lecture = library
        .create_lecture(&args.course, &args.title, &args.language)
        .await?;
    println!("{}", lecture.id);
    Ok(())
}

/// Logs progress instead of persisting it.
struct LogProgress;

#[async_trait]
impl Progress for LogProgress {
    async fn report(&self, percent: u8, message: &str) {
        tracing::info!(percent, "{message}");
    }
}

pub async fn generate(config: &Config, args: GenerateArgs) -> anyhow::Result<()> {
    if args.out.exists() && !args.force {
        anyhow::bail!("output already exists: {}", args.out.display());
    }
    let transcript = tokio::fs::read_to_string(&args.transcript)
        .await
        .with_context(|| format!("read transcript: {}", args.transcript.display()))?;

    let workdir = tempfile::tempdir().context("create work dir")?;
    let mut pages = Vec::new();
    for path in &args.materials {
        pages.extend(read_reference_pages(path, workdir.path()).await?);
    }

    let mut options = config.generation_options();
    options.documents_matching &= !args.no_matching;
    if let Some(threshold) = args.threshold {
        options.adherence_threshold = threshold.min(100);
    }
    if let Some(retries) = args.max_retries {
        options.maximum_retries = retries;
    }

    let generator = ToolGenerator::new(config.require_llm_client()?);
    let material = generator
        .generate(
            GenerationInput {
                kind: args.kind,
                title: args.title.as_deref(),
                transcript: &transcript,
                pages: &pages,
            },
            &options,
            &LogProgress,
        )
        .await
        .with_context(|| format!("generate {}", args.kind.label()))?;

    if let Some(parent) = args.out.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }
    tokio::fs::write(&args.out, &material.content)
        .await
        .with_context(|| format!("write output: {}", args.out.display()))?;
    if let Some(report) = &args.report {
        let json = serde_json::to_string_pretty(&material).context("serialize report")?;
        tokio::fs::write(report, json)
            .await
            .with_context(|| format!("write report: {}", report.display()))?;
    }

    let total = material.total_usage();
    tracing::info!(
        out = %args.out.display(),
        sections = material.sections.len(),
        citations = material.citations.len(),
        calls = total.calls,
        cost = total.cost,
        "material written"
    );
    Ok(())
}

async fn read_reference_pages(path: &Path, workdir: &Path) -> anyhow::Result<Vec<ReferencePage>> {
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("material path has no file name: {}", path.display()))?;
    let processed = PlainTextDocumentProcessor
        .process(path, workdir, "English", &LogProgress)
        .await?;
    Ok(processed
        .pages
        .into_iter()
        .map(|page| ReferencePage {
            file: file.clone(),
            number: page.number,
            text: page.text,
            image_path: page.image_path,
        })
        .collect())
}
