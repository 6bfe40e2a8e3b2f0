use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::app::model::{JobKind, JobStatus};
use crate::generator::MaterialKind;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker pool until interrupted.
    Worker(WorkerArgs),
    /// Add a job to the queue and print its id.
    Enqueue(EnqueueArgs),
    /// Print a job as JSON.
    Status(JobArgs),
    /// Cancel a pending or running job.
    Cancel(JobArgs),
    /// List recent jobs.
    Jobs(JobsArgs),
    Lecture {
        #[command(subcommand)]
        command: LectureCommand,
    },
    /// Generate material from local files without the queue.
    Generate(GenerateArgs),
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Overrides LECTERN_WORKERS.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Fail jobs left running by a previous worker process before starting.
    #[arg(long, default_value_t = false)]
    pub recover: bool,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// transcribe_media, ingest_document, build_material, publish_material or download_remote.
    pub kind: JobKind,

    /// Job payload as a JSON object.
    #[arg(long)]
    pub payload: String,
}

#[derive(Debug, Args)]
pub struct JobArgs {
    pub job_id: String,
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    #[arg(long)]
    pub status: Option<JobStatus>,

    #[arg(long, default_value_t = 20)]
    pub limit: u32,
}

#[derive(Debug, Subcommand)]
pub enum LectureCommand {
    /// Create a lecture and print its id.
    Create(LectureCreateArgs),
}

#[derive(Debug, Args)]
pub struct LectureCreateArgs {
    #[arg(long)]
    pub course: String,

    #[arg(long)]
    pub title: String,

    #[arg(long, default_value = "English")]
    pub language: String,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Transcript text file.
    #[arg(long)]
    pub transcript: PathBuf,

    /// Reference document (text, pages separated by form feeds). Repeatable.
    #[arg(long = "material")]
    pub materials: Vec<PathBuf>,

    #[arg(long, default_value = "guide")]
    pub kind: MaterialKind,

    #[arg(long)]
    pub title: Option<String>,

    /// Output markdown path.
    #[arg(long)]
    pub out: PathBuf,

    /// Overwrite the output if it exists.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Skip documents matching and use every reference page.
    #[arg(long, default_value_t = false)]
    pub no_matching: bool,

    /// Overrides LECTERN_ADHERENCE_THRESHOLD.
    #[arg(long)]
    pub threshold: Option<u8>,

    /// Overrides LECTERN_MAX_RETRIES.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Write usage and section scores as JSON here.
    #[arg(long)]
    pub report: Option<PathBuf>,
}
