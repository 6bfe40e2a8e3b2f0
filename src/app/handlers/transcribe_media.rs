use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{JobHandler, Services};
use crate::app::runner::JobContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribeMediaPayload {
    pub lecture_id: String,
    pub media: Vec<PathBuf>,
}

pub struct TranscribeMediaHandler {
    services: Arc<Services>,
}

impl TranscribeMediaHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for TranscribeMediaHandler {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let payload: TranscribeMediaPayload = ctx.payload()?;
        let transcriber = self
            .services
            .transcriber
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no transcriber configured (set LECTERN_TRANSCRIBER)"))?;
        let lecture = self.services.library.require_lecture(&payload.lecture_id).await?;
        for path in &payload.media {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                anyhow::bail!("media file not found: {}", path.display());
            }
        }

        let transcription = transcriber
            .transcribe(&payload.media, ctx.work_dir(), ctx.progress())
            .await
            .context("transcribe media")?;
        if transcription.segments.is_empty() {
            anyhow::bail!("transcription produced no text");
        }
        ctx.ensure_active()?;

        let transcript = self
            .services
            .library
            .save_transcript(&lecture.id, &transcription.segments)
            .await?;
        ctx.progress()
            .report_details(
                95,
                "transcript saved",
                None,
                Some(transcription.metrics.clone()),
            )
            .await;

        Ok(json!({
            "segments": transcript.segments.len(),
            "characters": transcript.text.chars().count(),
        }))
    }
}
