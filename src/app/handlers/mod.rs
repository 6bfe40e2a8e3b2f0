//! One handler per job kind, registered at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::app::job_store::JobStore;
use crate::app::model::JobKind;
use crate::app::runner::JobContext;
use crate::collaborators::{DocumentProcessor, TranscriptionService};
use crate::export::ExportAssembler;
use crate::generator::{GenerationOptions, ToolGenerator};
use crate::library::Library;

mod build_material;
mod download_remote;
mod ingest_document;
mod publish_material;
mod transcribe_media;

pub use build_material::{BuildMaterialHandler, BuildMaterialPayload};
pub use download_remote::{DownloadRemoteHandler, DownloadRemotePayload, DownloadTarget};
pub use ingest_document::{IngestDocumentHandler, IngestDocumentPayload};
pub use publish_material::PublishMaterialHandler;
pub use transcribe_media::{TranscribeMediaHandler, TranscribeMediaPayload};

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Does the job's work and returns its result. Errors fail the job.
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value>;
}

/// Shared dependencies of the handlers.
#[derive(Clone)]
pub struct Services {
    pub library: Library,
    pub jobs: Arc<dyn JobStore>,
    /// `None` when no LLM provider is configured; material builds then fail.
    pub generator: Option<ToolGenerator>,
    pub generation_defaults: GenerationOptions,
    pub transcriber: Option<Arc<dyn TranscriptionService>>,
    pub documents: Arc<dyn DocumentProcessor>,
    pub exporter: ExportAssembler,
    pub data_dir: PathBuf,
    pub http: reqwest::Client,
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler of every job kind.
    pub fn standard(services: Arc<Services>) -> Self {
        let mut registry = Self::new();
        registry.register(
            JobKind::TranscribeMedia,
            TranscribeMediaHandler::new(Arc::clone(&services)),
        );
        registry.register(
            JobKind::IngestDocument,
            IngestDocumentHandler::new(Arc::clone(&services)),
        );
        registry.register(
            JobKind::BuildMaterial,
            BuildMaterialHandler::new(Arc::clone(&services)),
        );
        registry.register(
            JobKind::PublishMaterial,
            PublishMaterialHandler::new(Arc::clone(&services)),
        );
        registry.register(JobKind::DownloadRemote, DownloadRemoteHandler::new(services));
        registry
    }

    /// Replaces any handler already registered for `kind`.
    pub fn register(&mut self, kind: JobKind, handler: impl JobHandler + 'static) {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }
}
