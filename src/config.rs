use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use url::Url;

use crate::app::dispatcher::DispatcherConfig;
use crate::generator::{DEFAULT_MODEL, GenerationOptions, StageModels};
use crate::llm::openai::OpenAiProvider;
use crate::llm::{LlmClient, Pricing};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Process configuration, read from `LECTERN_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub data_dir: PathBuf,
    pub workers: usize,
    pub poll_interval: Duration,
    pub subscriber_buffer: usize,

    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model: String,
    pub max_cost_per_call: f64,
    pub pricing: Pricing,
    pub adherence_threshold: u8,
    pub max_retries: u32,

    pub pandoc: String,
    /// Forces one pandoc PDF engine instead of trying the installed ones in turn.
    pub pdf_engine: Option<String>,
    pub render_timeout: Duration,
    /// Speech-to-text command line; transcription jobs fail when unset.
    pub transcriber: Option<String>,
    pub transcribe_timeout: Duration,
    pub public_base_url: Option<Url>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let adherence_threshold = parse_or(&var, "LECTERN_ADHERENCE_THRESHOLD", 70u8)?;
        if adherence_threshold > 100 {
            anyhow::bail!("LECTERN_ADHERENCE_THRESHOLD must be between 0 and 100");
        }
        let max_cost_per_call = parse_or(&var, "LECTERN_MAX_COST_PER_CALL", 1.0f64)?;
        if max_cost_per_call.is_nan() || max_cost_per_call <= 0.0 {
            anyhow::bail!("LECTERN_MAX_COST_PER_CALL must be positive");
        }

        Ok(Self {
            database_url: var("LECTERN_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://lectern.db".to_owned()),
            data_dir: var("LECTERN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("lectern-data")),
            workers: parse_or(&var, "LECTERN_WORKERS", 2usize)?.max(1),
            poll_interval: Duration::from_millis(parse_or(&var, "LECTERN_POLL_INTERVAL_MS", 1000u64)?),
            subscriber_buffer: parse_or(&var, "LECTERN_SUBSCRIBER_BUFFER", 64usize)?.max(1),

            openai_api_key: var("OPENAI_API_KEY"),
            openai_base_url: var("LECTERN_OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_owned()),
            model: var("LECTERN_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            max_cost_per_call,
            pricing: Pricing {
                input_per_mtok: parse_or(
                    &var,
                    "LECTERN_PRICE_INPUT_PER_MTOK",
                    Pricing::default().input_per_mtok,
                )?,
                output_per_mtok: parse_or(
                    &var,
                    "LECTERN_PRICE_OUTPUT_PER_MTOK",
                    Pricing::default().output_per_mtok,
                )?,
            },
            adherence_threshold,
            max_retries: parse_or(&var, "LECTERN_MAX_RETRIES", 3u32)?,

            pandoc: var("LECTERN_PANDOC").unwrap_or_else(|| "pandoc".to_owned()),
            pdf_engine: var("LECTERN_PDF_ENGINE"),
            render_timeout: Duration::from_secs(parse_or(&var, "LECTERN_RENDER_TIMEOUT_SECS", 300u64)?),
            transcriber: var("LECTERN_TRANSCRIBER"),
            transcribe_timeout: Duration::from_secs(parse_or(
                &var,
                "LECTERN_TRANSCRIBE_TIMEOUT_SECS",
                3600u64,
            )?),
            public_base_url: var("LECTERN_PUBLIC_BASE_URL")
                .map(|raw| {
                    Url::parse(&raw).with_context(|| format!("invalid LECTERN_PUBLIC_BASE_URL={raw:?}"))
                })
                .transpose()?,
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers,
            poll_interval: self.poll_interval,
            subscriber_buffer: self.subscriber_buffer,
        }
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            adherence_threshold: self.adherence_threshold,
            maximum_retries: self.max_retries,
            models: StageModels::new(&self.model),
            ..GenerationOptions::default()
        }
    }

    /// The OpenAI-backed client, or `None` without an API key.
    pub fn llm_client(&self) -> anyhow::Result<Option<LlmClient>> {
        let Some(api_key) = &self.openai_api_key else {
            return Ok(None);
        };
        let provider = OpenAiProvider::new(&self.openai_base_url, api_key.clone(), self.pricing)
            .context("build openai provider")?;
        Ok(Some(LlmClient::new(
            Arc::new(provider),
            self.pricing,
            self.max_cost_per_call,
        )))
    }

    pub fn require_llm_client(&self) -> anyhow::Result<LlmClient> {
        self.llm_client()?
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is not set"))
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {name}={raw:?}: {err}")),
    }
}
