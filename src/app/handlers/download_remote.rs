use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt as _;
use url::Url;

use super::{IngestDocumentPayload, JobHandler, Services, TranscribeMediaPayload};
use crate::app::model::{Job, JobKind};
use crate::app::runner::JobContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadTarget {
    Media,
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRemotePayload {
    pub lecture_id: String,
    pub url: String,
    pub target: DownloadTarget,
    #[serde(default)]
    pub language: Option<String>,
}

/// Fetches a remote file into the data directory, then enqueues the job that
/// consumes it.
pub struct DownloadRemoteHandler {
    services: Arc<Services>,
}

impl DownloadRemoteHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn download(&self, ctx: &JobContext, url: &Url, out: &Path) -> anyhow::Result<u64> {
        let resp = self
            .services
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("request {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("download failed ({}): {url}", resp.status());
        }
        let expected = resp.content_length();

        let mut file = tokio::fs::File::create(out)
            .await
            .with_context(|| format!("create download: {}", out.display()))?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        let mut last_percent = 0u8;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("read body of {url}"))?;
            ctx.ensure_active()?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write download: {}", out.display()))?;
            written += chunk.len() as u64;

            if let Some(total) = expected.filter(|t| *t > 0) {
                let percent = (written.min(total) * 90 / total) as u8;
                if percent >= last_percent + 10 {
                    last_percent = percent;
                    ctx.progress().report(percent, "downloading").await;
                }
            }
        }
        file.flush()
            .await
            .with_context(|| format!("flush download: {}", out.display()))?;
        Ok(written)
    }
}

fn file_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| "download".to_owned())
}

#[async_trait]
impl JobHandler for DownloadRemoteHandler {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let payload: DownloadRemotePayload = ctx.payload()?;
        let url = Url::parse(&payload.url).with_context(|| format!("invalid url: {}", payload.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("unsupported url scheme: {}", url.scheme());
        }
        let lecture = self.services.library.require_lecture(&payload.lecture_id).await?;

        let dir = self.services.data_dir.join("downloads").join(&ctx.job.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create download dir: {}", dir.display()))?;
        let path: PathBuf = dir.join(file_name_from_url(&url));

        let fetched = async {
            let bytes = self.download(ctx, &url, &path).await?;
            ctx.ensure_active()?;
            anyhow::Ok(bytes)
        }
        .await;
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(path = %dir.display(), ?cleanup, "remove partial download");
                }
                return Err(err);
            }
        };

        let follow_up = match payload.target {
            DownloadTarget::Media => Job::new(
                JobKind::TranscribeMedia,
                serde_json::to_value(TranscribeMediaPayload {
                    lecture_id: lecture.id.clone(),
                    media: vec![path.clone()],
                })?,
            ),
            DownloadTarget::Document => Job::new(
                JobKind::IngestDocument,
                serde_json::to_value(IngestDocumentPayload {
                    lecture_id: lecture.id.clone(),
                    path: path.clone(),
                    title: None,
                    language: payload.language.clone(),
                })?,
            ),
        };
        self.services
            .jobs
            .insert(&follow_up)
            .await
            .context("enqueue follow-up job")?;

        tracing::info!(
            job_id = %ctx.job.id,
            follow_up_job_id = %follow_up.id,
            kind = %follow_up.kind,
            bytes,
            "download finished"
        );
        Ok(json!({
            "path": path,
            "bytes": bytes,
            "follow_up_job_id": follow_up.id,
        }))
    }
}
