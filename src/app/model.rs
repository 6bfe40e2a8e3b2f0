use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound as _, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => anyhow::bail!("unknown job status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TranscribeMedia,
    IngestDocument,
    BuildMaterial,
    PublishMaterial,
    DownloadRemote,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        Self::TranscribeMedia,
        Self::IngestDocument,
        Self::BuildMaterial,
        Self::PublishMaterial,
        Self::DownloadRemote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TranscribeMedia => "transcribe_media",
            Self::IngestDocument => "ingest_document",
            Self::BuildMaterial => "build_material",
            Self::PublishMaterial => "publish_material",
            Self::DownloadRemote => "download_remote",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown job kind: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub progress_message: String,
    /// Interpreted only by the handler registered for `kind`.
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Current time truncated to the microsecond precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl Job {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Pending,
            progress: 0,
            progress_message: String::new(),
            payload,
            result: None,
            error: None,
            created_at: now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Notification delivered to a job's subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

impl ProgressEvent {
    pub fn progress(job_id: &str, percent: u8, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_owned(),
            status: JobStatus::Running,
            percent,
            message: message.into(),
            error: None,
            result: None,
            metadata: None,
            metrics: None,
        }
    }

    /// Event describing a job's current stored state.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            percent: job.progress,
            message: job.progress_message.clone(),
            error: job.error.clone(),
            result: job.result.clone(),
            metadata: None,
            metrics: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_statuses_parse_their_names() -> anyhow::Result<()> {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>()?, kind);
            assert_eq!(serde_json::to_value(kind)?, kind.as_str());
        }
        assert_eq!("cancelled".parse::<JobStatus>()?, JobStatus::Cancelled);
        assert!("queued".parse::<JobStatus>().is_err());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        Ok(())
    }
}
