use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{JobHandler, Services};
use crate::app::runner::JobContext;
use crate::generator::{GenerationInput, GenerationOptions, MaterialKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMaterialPayload {
    pub lecture_id: String,
    pub kind: MaterialKind,
    #[serde(default)]
    pub title: Option<String>,
    /// Replaces the worker's default generation options for this build.
    #[serde(default)]
    pub options: Option<GenerationOptions>,
}

pub struct BuildMaterialHandler {
    services: Arc<Services>,
}

impl BuildMaterialHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for BuildMaterialHandler {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let payload: BuildMaterialPayload = ctx.payload()?;
        let generator = self
            .services
            .generator
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no LLM provider configured (set OPENAI_API_KEY)"))?;
        let library = &self.services.library;
        let lecture = library.require_lecture(&payload.lecture_id).await?;
        let transcript = library
            .get_transcript(&lecture.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("lecture {} has no transcript", lecture.id))?;
        let pages = library.list_lecture_pages(&lecture.id).await?;

        let options = match payload.options.clone() {
            Some(options) => options,
            None => GenerationOptions {
                language: lecture.language.clone(),
                ..self.services.generation_defaults.clone()
            },
        };

        let title = payload.title.as_deref().or(Some(lecture.title.as_str()));
        let material = generator
            .generate(
                GenerationInput {
                    kind: payload.kind,
                    title,
                    transcript: &transcript.text,
                    pages: &pages,
                },
                &options,
                ctx.progress(),
            )
            .await
            .with_context(|| format!("generate {}", payload.kind.label()))?;
        ctx.ensure_active()?;

        let total = material.total_usage();
        let metrics = json!({
            "usage": material.usage,
            "total": total,
            "sections": material.sections,
            "matched_ranges": material.matched_ranges,
        });
        let stored = library
            .save_material(
                &lecture.id,
                material.kind,
                &material.title,
                &material.content,
                &material.citations,
                &metrics,
            )
            .await?;

        tracing::info!(
            job_id = %ctx.job.id,
            material_id = %stored.id,
            sections = material.sections.len(),
            citations = material.citations.len(),
            calls = total.calls,
            cost = total.cost,
            "material built"
        );
        ctx.progress()
            .report_details(
                98,
                "material saved",
                Some(json!({"material_id": stored.id, "title": material.title})),
                Some(json!({"llm": total})),
            )
            .await;

        Ok(json!({
            "material_id": stored.id,
            "title": material.title,
            "sections": material.sections.len(),
            "citations": material.citations.len(),
        }))
    }
}
