use async_trait::async_trait;

/// Receives progress from long-running work (jobs, collaborators, generation).
///
/// Implementations must tolerate calls after the work was cancelled.
#[async_trait]
pub trait Progress: Send + Sync {
    async fn report(&self, percent: u8, message: &str);

    /// Progress carrying structured metadata and metrics for observers.
    async fn report_details(
        &self,
        percent: u8,
        message: &str,
        metadata: Option<serde_json::Value>,
        metrics: Option<serde_json::Value>,
    ) {
        let _ = (metadata, metrics);
        self.report(percent, message).await;
    }
}

/// Progress sink that discards everything.
pub struct NoProgress;

#[async_trait]
impl Progress for NoProgress {
    async fn report(&self, _percent: u8, _message: &str) {}
}
