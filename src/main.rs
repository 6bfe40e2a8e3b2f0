use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use lectern::cli::{Cli, Command, LectureCommand};
use lectern::commands;
use lectern::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    lectern::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");
    let config = Config::from_env().context("load config")?;

    match cli.command {
        Command::Worker(args) => {
            commands::worker(config, args).await.context("worker")?;
        }
        Command::Enqueue(args) => {
            commands::enqueue(&config, args).await.context("enqueue")?;
        }
        Command::Status(args) => {
            commands::status(&config, args).await.context("status")?;
        }
        Command::Cancel(args) => {
            commands::cancel(&config, args).await.context("cancel")?;
        }
        Command::Jobs(args) => {
            commands::jobs(&config, args).await.context("jobs")?;
        }
        Command::Lecture {
            command: LectureCommand::Create(args),
        } => {
            commands::lecture_create(&config, args)
                .await
                .context("lecture create")?;
        }
        Command::Generate(args) => {
            commands::generate(&config, args).await.context("generate")?;
        }
    }

    Ok(())
}
