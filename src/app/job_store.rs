use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;

use crate::app::model::{Job, JobStatus, now};

/// Durable job records. Every state change is a conditional update, so a job only
/// moves forward: pending, running, then one terminal status.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> anyhow::Result<()>;
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<Job>>;
    async fn list(&self, status: Option<JobStatus>, limit: u32) -> anyhow::Result<Vec<Job>>;

    /// Atomically moves the oldest pending job to `running` and returns it.
    async fn claim_next(&self) -> anyhow::Result<Option<Job>>;

    /// Returns `false` when the job is no longer running.
    async fn update_progress(&self, job_id: &str, percent: u8, message: &str)
    -> anyhow::Result<bool>;
    async fn complete(&self, job_id: &str, result: &serde_json::Value) -> anyhow::Result<bool>;
    async fn fail(&self, job_id: &str, error: &str) -> anyhow::Result<bool>;
    /// Cancels a pending or running job. Returns `false` for terminal jobs.
    async fn cancel(&self, job_id: &str) -> anyhow::Result<bool>;

    /// Fails jobs left `running` by a process that died. Returns how many.
    async fn recover_interrupted(&self) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    kind: String,
    status: String,
    progress: i64,
    progress_message: String,
    payload: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> anyhow::Result<Self> {
        Ok(Self {
            kind: row.kind.parse()?,
            status: row.status.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            progress_message: row.progress_message,
            payload: serde_json::from_str(&row.payload)
                .with_context(|| format!("parse payload of job {}", row.id))?,
            result: row
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .with_context(|| format!("parse result of job {}", row.id))?,
            error: row.error,
            created_at: parse_timestamp(&row.created_at)?,
            started_at: row.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_timestamp).transpose()?,
            id: row.id,
        })
    }
}

/// Fixed-width UTC timestamps, so text order is time order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parse timestamp: {raw}"))?
        .with_timezone(&Utc))
}

const JOB_COLUMNS: &str = "id, kind, status, progress, progress_message, payload, result, error, \
created_at, started_at, completed_at";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&job.payload).context("serialize payload")?;
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize result")?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, status, progress, progress_message, payload, result,
                              error, created_at, started_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&job.id)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(i64::from(job.progress))
        .bind(&job.progress_message)
        .bind(payload)
        .bind(result)
        .bind(&job.error)
        .bind(timestamp(job.created_at))
        .bind(job.started_at.map(timestamp))
        .bind(job.completed_at.map(timestamp))
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert job {}", job.id))?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("select job {job_id}"))?;
        row.map(Job::try_from).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: u32) -> anyhow::Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ?1 IS NULL OR status = ?1 \
             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))
        .bind(status.map(JobStatus::as_str))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("list jobs")?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn claim_next(&self) -> anyhow::Result<Option<Job>> {
        let mut tx = self.pool.begin().await.context("begin claim")?;
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = ?1, progress = 0
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending'
                ORDER BY created_at, rowid
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(timestamp(now()))
        .fetch_optional(&mut *tx)
        .await
        .context("claim pending job")?;
        tx.commit().await.context("commit claim")?;
        row.map(Job::try_from).transpose()
    }

    async fn update_progress(
        &self,
        job_id: &str,
        percent: u8,
        message: &str,
    ) -> anyhow::Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE jobs SET progress = ?2, progress_message = ?3
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(i64::from(percent.min(100)))
        .bind(message)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update progress of job {job_id}"))?;
        Ok(done.rows_affected() == 1)
    }

    async fn complete(&self, job_id: &str, result: &serde_json::Value) -> anyhow::Result<bool> {
        let result = serde_json::to_string(result).context("serialize result")?;
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', progress = 100, result = ?2, completed_at = ?3
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(result)
        .bind(timestamp(now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("complete job {job_id}"))?;
        Ok(done.rows_affected() == 1)
    }

    async fn fail(&self, job_id: &str, error: &str) -> anyhow::Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = ?2, completed_at = ?3
            WHERE id = ?1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(timestamp(now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("fail job {job_id}"))?;
        Ok(done.rows_affected() == 1)
    }

    async fn cancel(&self, job_id: &str) -> anyhow::Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = ?2
            WHERE id = ?1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id)
        .bind(timestamp(now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("cancel job {job_id}"))?;
        Ok(done.rows_affected() == 1)
    }

    async fn recover_interrupted(&self) -> anyhow::Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = 'interrupted by restart', completed_at = ?1
            WHERE status = 'running'
            "#,
        )
        .bind(timestamp(now()))
        .execute(&self.pool)
        .await
        .context("recover interrupted jobs")?;
        Ok(done.rows_affected())
    }
}
