use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{JobHandler, Services};
use crate::app::runner::JobContext;
use crate::export::ExportRequest;

pub struct PublishMaterialHandler {
    services: Arc<Services>,
}

impl PublishMaterialHandler {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for PublishMaterialHandler {
    async fn handle(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let request: ExportRequest = ctx.payload()?;
        let outcome = self
            .services
            .exporter
            .export(&request, ctx.work_dir(), ctx.progress())
            .await?;

        tracing::info!(
            job_id = %ctx.job.id,
            material_id = %request.material_id,
            format = request.format.extension(),
            digest = %outcome.artifact.digest,
            "material published"
        );
        Ok(json!({
            "path": outcome.artifact.path,
            "uri": outcome.artifact.uri,
            "online_copy_uri": outcome.online_copy.as_ref().map(|a| a.uri.as_str()),
            "cited_images": outcome.cited_images,
        }))
    }
}
