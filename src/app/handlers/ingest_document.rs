use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{JobHandler, Services};
use crate::app::runner::JobContext;
use crate::collaborators::Page;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestDocumentPayload {
    pub lecture_id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

pub struct IngestDocumentHandler {
    services: Arc<Services>,
}

impl IngestDocumentHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn pages_dir(&self, document_id: &str) -> PathBuf {
        self.services
            .data_dir
            .join("documents")
            .join(document_id)
            .join("pages")
    }

    /// Moves page images out of the work directory into the document's own folder.
    async fn keep_page_images(&self, document_id: &str, pages: &mut [Page]) -> anyhow::Result<()> {
        let dir = self.pages_dir(document_id);
        for page in pages.iter_mut() {
            let Some(source) = page.image_path.take() else {
                continue;
            };
            let extension = source
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png");
            let target = dir.join(format!("{}.{extension}", page.number));
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create pages dir: {}", dir.display()))?;
            tokio::fs::copy(&source, &target)
                .await
                .with_context(|| format!("copy page image: {}", source.display()))?;
            page.image_path = Some(target);
        }
        Ok(())
    }
}

fn default_title(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Document".to_owned())
}

#[async_trait]
impl JobHandler for IngestDocumentHandler {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let payload: IngestDocumentPayload = ctx.payload()?;
        let library = &self.services.library;
        let lecture = library.require_lecture(&payload.lecture_id).await?;
        if !tokio::fs::try_exists(&payload.path).await.unwrap_or(false) {
            anyhow::bail!("document not found: {}", payload.path.display());
        }
        let language = payload.language.as_deref().unwrap_or(&lecture.language);

        let processed = self
            .services
            .documents
            .process(&payload.path, ctx.work_dir(), language, ctx.progress())
            .await
            .context("process document")?;
        ctx.ensure_active()?;

        let file_name = payload
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("document path has no file name"))?;
        let title = payload
            .title
            .clone()
            .unwrap_or_else(|| default_title(&payload.path));
        let document = library.create_document(&lecture.id, &file_name, &title).await?;

        let mut pages = processed.pages;
        let stored = async {
            self.keep_page_images(&document.id, &mut pages).await?;
            library.replace_document_pages(&document.id, &pages).await
        }
        .await;
        if let Err(err) = stored {
            if let Err(cleanup) = library.delete_document(&document.id).await {
                tracing::warn!(document_id = %document.id, error = %format!("{cleanup:#}"), "remove partial document");
            }
            let dir = self.pages_dir(&document.id);
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %dir.display(), ?cleanup, "remove partial page images");
            }
            return Err(err);
        }

        tracing::info!(
            job_id = %ctx.job.id,
            document_id = %document.id,
            pages = pages.len(),
            "document ingested"
        );
        ctx.progress()
            .report_details(
                95,
                "pages stored",
                Some(json!({"document_id": document.id})),
                Some(processed.metrics),
            )
            .await;

        Ok(json!({
            "document_id": document.id,
            "pages": pages.len(),
        }))
    }
}
