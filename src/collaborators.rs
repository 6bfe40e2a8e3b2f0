//! Interfaces to the external engines the jobs depend on (speech-to-text and page
//! reading), plus the local implementations the binary ships with.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::progress::Progress;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub start_ms: u64,
    #[serde(default)]
    pub end_ms: u64,
    pub text: String,
}

/// One page of a reference document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-based.
    pub number: u32,
    pub image_path: Option<PathBuf>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub segments: Vec<Segment>,
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDocument {
    pub pages: Vec<Page>,
    pub metrics: serde_json::Value,
}

#[async_trait]
pub trait TranscriptionService: Send + Sync {
    async fn transcribe(
        &self,
        media: &[PathBuf],
        workdir: &Path,
        progress: &dyn Progress,
    ) -> anyhow::Result<Transcription>;
}

#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    async fn process(
        &self,
        document: &Path,
        workdir: &Path,
        language: &str,
        progress: &dyn Progress,
    ) -> anyhow::Result<ProcessedDocument>;
}

/// Runs an external speech-to-text command once per media file.
///
/// The command receives the media path as its last argument and runs inside the
/// work directory. Its stdout is either a JSON array of segments or plain text, one
/// segment per non-empty line.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    program: OsString,
    args: Vec<OsString>,
    timeout: Duration,
}

impl CommandTranscriber {
    pub fn new(program: impl Into<OsString>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Parses `program arg arg ...` as configured in the environment.
    pub fn from_command_line(command_line: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("transcriber command is empty"))?;
        Ok(Self::new(program, timeout).with_args(parts))
    }
}

#[async_trait]
impl TranscriptionService for CommandTranscriber {
    async fn transcribe(
        &self,
        media: &[PathBuf],
        workdir: &Path,
        progress: &dyn Progress,
    ) -> anyhow::Result<Transcription> {
        if media.is_empty() {
            anyhow::bail!("no media files to transcribe");
        }

        let started = Instant::now();
        let mut segments = Vec::new();
        let mut offset_ms = 0;
        for (index, path) in media.iter().enumerate() {
            let percent = (index * 90 / media.len()) as u8;
            progress
                .report(percent, &format!("transcribing {}", path.display()))
                .await;

            let stdout = run_with_timeout(
                &self.program,
                self.args.iter().cloned().chain([path.as_os_str().to_owned()]),
                workdir,
                self.timeout,
            )
            .await
            .with_context(|| format!("transcribe {}", path.display()))?;

            let parsed = parse_transcript_output(&stdout);
            tracing::info!(
                media = %path.display(),
                segments = parsed.len(),
                "media transcribed"
            );
            // Files are consecutive parts of one lecture.
            let next_offset = parsed
                .iter()
                .map(|s| s.end_ms)
                .max()
                .map_or(offset_ms, |end| offset_ms + end);
            segments.extend(parsed.into_iter().map(|s| Segment {
                start_ms: s.start_ms + offset_ms,
                end_ms: s.end_ms + offset_ms,
                text: s.text,
            }));
            offset_ms = next_offset;
        }

        Ok(Transcription {
            metrics: json!({
                "media_files": media.len(),
                "segments": segments.len(),
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
            segments,
        })
    }
}

fn parse_transcript_output(stdout: &str) -> Vec<Segment> {
    if let Ok(segments) = serde_json::from_str::<Vec<Segment>>(stdout.trim()) {
        return segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .collect();
    }
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Segment {
            start_ms: 0,
            end_ms: 0,
            text: line.to_owned(),
        })
        .collect()
}

/// Runs a command to completion, killing it when the timeout elapses.
pub(crate) async fn run_with_timeout(
    program: &OsString,
    args: impl IntoIterator<Item = OsString>,
    workdir: &Path,
    timeout: Duration,
) -> anyhow::Result<String> {
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn {}", program.to_string_lossy()))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "{} timed out after {}s",
                program.to_string_lossy(),
                timeout.as_secs()
            )
        })?
        .with_context(|| format!("wait for {}", program.to_string_lossy()))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} failed ({}): {}",
            program.to_string_lossy(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    String::from_utf8(output.stdout)
        .with_context(|| format!("{} wrote non-UTF-8 output", program.to_string_lossy()))
}

/// Reads text documents whose pages are separated by form feeds.
///
/// A sibling directory named `<stem>.pages/` holding `<n>.png` files supplies page
/// images when present.
#[derive(Debug, Clone, Default)]
pub struct PlainTextDocumentProcessor;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

#[async_trait]
impl DocumentProcessor for PlainTextDocumentProcessor {
    async fn process(
        &self,
        document: &Path,
        _workdir: &Path,
        language: &str,
        progress: &dyn Progress,
    ) -> anyhow::Result<ProcessedDocument> {
        let extension = document
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
            anyhow::bail!(
                "unsupported document type {:?}: {}",
                extension,
                document.display()
            );
        }

        progress.report(10, "reading document").await;
        let raw = tokio::fs::read_to_string(document)
            .await
            .with_context(|| format!("read document: {}", document.display()))?;

        let images_dir = document.with_extension("pages");
        let mut pages = Vec::new();
        for (index, text) in raw.split('\u{c}').enumerate() {
            let number = u32::try_from(index + 1).context("too many pages")?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            let image = images_dir.join(format!("{number}.png"));
            let image_path = tokio::fs::try_exists(&image)
                .await
                .unwrap_or(false)
                .then_some(image);
            pages.push(Page {
                number,
                image_path,
                text: text.to_owned(),
            });
        }
        if pages.is_empty() {
            anyhow::bail!("document has no text: {}", document.display());
        }

        let characters: usize = pages.iter().map(|p| p.text.chars().count()).sum();
        Ok(ProcessedDocument {
            metrics: json!({
                "pages": pages.len(),
                "characters": characters,
                "language": language,
            }),
            pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;

    #[test]
    fn transcript_output_accepts_json_or_lines() {
        let json = r#"[{"start_ms": 0, "end_ms": 900, "text": "Hello"}, {"text": "  "}]"#;
        assert_eq!(
            parse_transcript_output(json),
            vec![Segment {
                start_ms: 0,
                end_ms: 900,
                text: "Hello".to_owned()
            }]
        );

        let lines = parse_transcript_output("first line\n\n second line \n");
        assert_eq!(
            lines.iter().map(|s| s.text.as_str()).collect::<Vec<_>>(),
            vec!["first line", "second line"]
        );
    }

    #[tokio::test]
    async fn plain_text_pages_split_on_form_feed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "Cells\n\u{c}\u{c}Mitochondria make ATP.\n")?;
        std::fs::create_dir(dir.path().join("notes.pages"))?;
        std::fs::write(dir.path().join("notes.pages").join("3.png"), b"png")?;

        let processed = PlainTextDocumentProcessor
            .process(&path, dir.path(), "English", &NoProgress)
            .await?;
        assert_eq!(
            processed
                .pages
                .iter()
                .map(|p| (p.number, p.text.as_str(), p.image_path.is_some()))
                .collect::<Vec<_>>(),
            vec![(1, "Cells", false), (3, "Mitochondria make ATP.", true)]
        );
        assert_eq!(processed.metrics["pages"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn binary_documents_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("slides.pdf");
        std::fs::write(&path, b"%PDF")?;
        let err = PlainTextDocumentProcessor
            .process(&path, dir.path(), "English", &NoProgress)
            .await
            .expect_err("pdf is not plain text");
        assert!(err.to_string().contains("unsupported document type"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_transcriber_offsets_consecutive_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, r#"[{"start_ms": 0, "end_ms": 1000, "text": "one"}]"#)?;
        std::fs::write(&b, r#"[{"start_ms": 0, "end_ms": 500, "text": "two"}]"#)?;

        let transcriber = CommandTranscriber::new("cat", Duration::from_secs(10));
        let result = transcriber
            .transcribe(&[a, b], dir.path(), &NoProgress)
            .await?;
        assert_eq!(
            result
                .segments
                .iter()
                .map(|s| (s.start_ms, s.end_ms, s.text.as_str()))
                .collect::<Vec<_>>(),
            vec![(0, 1000, "one"), (1000, 1500, "two")]
        );
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_timeout_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = run_with_timeout(
            &OsString::from("sleep"),
            [OsString::from("5")],
            dir.path(),
            Duration::from_millis(100),
        )
        .await
        .expect_err("sleep outlives the timeout");
        assert!(err.to_string().contains("timed out"));
        Ok(())
    }
}
