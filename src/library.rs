//! Durable lecture library: lectures, transcripts, reference documents with their
//! pages, and generated materials with their structured citation sources.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;

use crate::app::job_store::{parse_timestamp, timestamp};
use crate::app::model::now;
use crate::collaborators::{Page, Segment};
use crate::generator::{MaterialKind, ReferencePage};
use crate::markdown::ParsedCitation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lecture {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub lecture_id: String,
    pub segments: Vec<Segment>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub lecture_id: String,
    pub file_name: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub id: String,
    pub lecture_id: String,
    pub kind: MaterialKind,
    pub title: String,
    pub content: String,
    pub metrics: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Library {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct LectureRow {
    id: String,
    course_id: String,
    title: String,
    language: String,
    created_at: String,
}

#[derive(FromRow)]
struct PageRow {
    file_name: String,
    number: i64,
    text: String,
    image_path: Option<String>,
}

#[derive(FromRow)]
struct MaterialRow {
    id: String,
    lecture_id: String,
    kind: String,
    title: String,
    content: String,
    metrics: String,
    created_at: String,
}

#[derive(FromRow)]
struct SourceRow {
    number: i64,
    description: String,
    file_name: Option<String>,
    pages: String,
}

impl Library {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_lecture(
        &self,
        course_id: &str,
        title: &str,
        language: &str,
    ) -> anyhow::Result<Lecture> {
        let lecture = Lecture {
            id: uuid::Uuid::new_v4().to_string(),
            course_id: course_id.to_owned(),
            title: title.to_owned(),
            language: language.to_owned(),
            created_at: now(),
        };
        sqlx::query(
            "INSERT INTO lectures (id, course_id, title, language, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&lecture.id)
        .bind(&lecture.course_id)
        .bind(&lecture.title)
        .bind(&lecture.language)
        .bind(timestamp(lecture.created_at))
        .execute(&self.pool)
        .await
        .context("insert lecture")?;
        Ok(lecture)
    }

    pub async fn get_lecture(&self, lecture_id: &str) -> anyhow::Result<Option<Lecture>> {
        let row: Option<LectureRow> = sqlx::query_as(
            "SELECT id, course_id, title, language, created_at FROM lectures WHERE id = ?1",
        )
        .bind(lecture_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("select lecture {lecture_id}"))?;
        row.map(|row| {
            Ok(Lecture {
                created_at: parse_timestamp(&row.created_at)?,
                id: row.id,
                course_id: row.course_id,
                title: row.title,
                language: row.language,
            })
        })
        .transpose()
    }

    /// Like [`Library::get_lecture`], but a missing lecture is an error.
    pub async fn require_lecture(&self, lecture_id: &str) -> anyhow::Result<Lecture> {
        self.get_lecture(lecture_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("lecture not found: {lecture_id}"))
    }

    pub async fn save_transcript(
        &self,
        lecture_id: &str,
        segments: &[Segment],
    ) -> anyhow::Result<Transcript> {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let encoded = serde_json::to_string(segments).context("serialize segments")?;
        sqlx::query(
            r#"
            INSERT INTO transcripts (lecture_id, segments, text, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(lecture_id) DO UPDATE
            SET segments = excluded.segments, text = excluded.text, updated_at = excluded.updated_at
            "#,
        )
        .bind(lecture_id)
        .bind(encoded)
        .bind(&text)
        .bind(timestamp(now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("save transcript of lecture {lecture_id}"))?;
        Ok(Transcript {
            lecture_id: lecture_id.to_owned(),
            segments: segments.to_vec(),
            text,
        })
    }

    pub async fn get_transcript(&self, lecture_id: &str) -> anyhow::Result<Option<Transcript>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT segments, text FROM transcripts WHERE lecture_id = ?1")
                .bind(lecture_id)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("select transcript of lecture {lecture_id}"))?;
        row.map(|(segments, text)| {
            Ok(Transcript {
                lecture_id: lecture_id.to_owned(),
                segments: serde_json::from_str(&segments).context("parse segments")?,
                text,
            })
        })
        .transpose()
    }

    pub async fn create_document(
        &self,
        lecture_id: &str,
        file_name: &str,
        title: &str,
    ) -> anyhow::Result<Document> {
        let document = Document {
            id: uuid::Uuid::new_v4().to_string(),
            lecture_id: lecture_id.to_owned(),
            file_name: file_name.to_owned(),
            title: title.to_owned(),
        };
        sqlx::query(
            "INSERT INTO documents (id, lecture_id, file_name, title, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&document.id)
        .bind(&document.lecture_id)
        .bind(&document.file_name)
        .bind(&document.title)
        .bind(timestamp(now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert document {file_name}"))?;
        Ok(document)
    }

    pub async fn delete_document(&self, document_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete document {document_id}"))?;
        Ok(())
    }

    /// Replaces all pages of a document in one transaction.
    pub async fn replace_document_pages(
        &self,
        document_id: &str,
        pages: &[Page],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("begin page replacement")?;
        sqlx::query("DELETE FROM document_pages WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .context("delete old pages")?;
        for page in pages {
            sqlx::query(
                "INSERT INTO document_pages (document_id, number, text, image_path) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(document_id)
            .bind(i64::from(page.number))
            .bind(&page.text)
            .bind(page.image_path.as_ref().map(|p| p.display().to_string()))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert page {}", page.number))?;
        }
        tx.commit().await.context("commit page replacement")?;
        Ok(())
    }

    /// Every reference page of a lecture, by document then page number.
    pub async fn list_lecture_pages(&self, lecture_id: &str) -> anyhow::Result<Vec<ReferencePage>> {
        let rows: Vec<PageRow> = sqlx::query_as(
            r#"
            SELECT d.file_name, p.number, p.text, p.image_path
            FROM document_pages p
            JOIN documents d ON d.id = p.document_id
            WHERE d.lecture_id = ?1
            ORDER BY d.created_at, d.rowid, p.number
            "#,
        )
        .bind(lecture_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("list pages of lecture {lecture_id}"))?;
        Ok(rows
            .into_iter()
            .map(|row| ReferencePage {
                file: row.file_name,
                number: u32::try_from(row.number).unwrap_or_default(),
                text: row.text,
                image_path: row.image_path.map(PathBuf::from),
            })
            .collect())
    }

    /// Page images of every lecture in a course, keyed by `(file name, page)`.
    pub async fn course_page_images(
        &self,
        course_id: &str,
    ) -> anyhow::Result<HashMap<(String, u32), PathBuf>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            r#"
            SELECT d.file_name, p.number, p.image_path
            FROM document_pages p
            JOIN documents d ON d.id = p.document_id
            JOIN lectures l ON l.id = d.lecture_id
            WHERE l.course_id = ?1 AND p.image_path IS NOT NULL
            ORDER BY d.created_at, d.rowid
            "#,
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("list page images of course {course_id}"))?;

        let mut images = HashMap::with_capacity(rows.len());
        for (file, number, path) in rows {
            let Ok(number) = u32::try_from(number) else {
                continue;
            };
            images.entry((file, number)).or_insert_with(|| PathBuf::from(path));
        }
        Ok(images)
    }

    /// Stores a material and its citation sources in one transaction.
    pub async fn save_material(
        &self,
        lecture_id: &str,
        kind: MaterialKind,
        title: &str,
        content: &str,
        citations: &[ParsedCitation],
        metrics: &serde_json::Value,
    ) -> anyhow::Result<Material> {
        let material = Material {
            id: uuid::Uuid::new_v4().to_string(),
            lecture_id: lecture_id.to_owned(),
            kind,
            title: title.to_owned(),
            content: content.to_owned(),
            metrics: metrics.clone(),
            created_at: now(),
        };

        let mut tx = self.pool.begin().await.context("begin material insert")?;
        sqlx::query(
            r#"
            INSERT INTO materials (id, lecture_id, kind, title, content, metrics, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&material.id)
        .bind(&material.lecture_id)
        .bind(material.kind.as_str())
        .bind(&material.title)
        .bind(&material.content)
        .bind(serde_json::to_string(metrics).context("serialize metrics")?)
        .bind(timestamp(material.created_at))
        .execute(&mut *tx)
        .await
        .context("insert material")?;

        for citation in citations {
            sqlx::query(
                r#"
                INSERT INTO material_sources (material_id, number, description, file_name, pages)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&material.id)
            .bind(i64::from(citation.number))
            .bind(&citation.description)
            .bind(&citation.file)
            .bind(serde_json::to_string(&citation.pages).context("serialize pages")?)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert source {}", citation.number))?;
        }
        tx.commit().await.context("commit material")?;
        Ok(material)
    }

    pub async fn get_material(&self, material_id: &str) -> anyhow::Result<Option<Material>> {
        let row: Option<MaterialRow> = sqlx::query_as(
            r#"
            SELECT id, lecture_id, kind, title, content, metrics, created_at
            FROM materials WHERE id = ?1
            "#,
        )
        .bind(material_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("select material {material_id}"))?;
        row.map(|row| {
            Ok(Material {
                kind: row.kind.parse()?,
                metrics: serde_json::from_str(&row.metrics).context("parse metrics")?,
                created_at: parse_timestamp(&row.created_at)?,
                id: row.id,
                lecture_id: row.lecture_id,
                title: row.title,
                content: row.content,
            })
        })
        .transpose()
    }

    pub async fn get_material_sources(
        &self,
        material_id: &str,
    ) -> anyhow::Result<Vec<ParsedCitation>> {
        let rows: Vec<SourceRow> = sqlx::query_as(
            r#"
            SELECT number, description, file_name, pages
            FROM material_sources WHERE material_id = ?1
            ORDER BY number
            "#,
        )
        .bind(material_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("select sources of material {material_id}"))?;
        rows.into_iter()
            .map(|row| {
                Ok(ParsedCitation {
                    number: u32::try_from(row.number).context("source number")?,
                    description: row.description,
                    file: row.file_name,
                    pages: serde_json::from_str(&row.pages).context("parse source pages")?,
                })
            })
            .collect()
    }
}
