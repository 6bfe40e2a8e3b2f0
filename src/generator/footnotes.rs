//! Footnote healing: batched, best-effort reconciliation of citation sources and
//! rewriting of citation prose.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::generator::matching::SourceListing;
use crate::generator::{GenerationError, Run, prompts};
use crate::llm::{LlmError, Stage, extract_json};
use crate::markdown::{ParsedCitation, parse_page_list};

pub const FOOTNOTE_BATCH_SIZE: usize = 10;

const HEALING_MAX_OUTPUT_TOKENS: u32 = 2048;

static SOURCE_PARENTHETICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s*[(\[][^)\]]*(?:\.(?:pdf|pptx?|docx?|md|txt)\b|\bpp?\.\s*\d|\bpages?\s+\d)[^)\]]*[)\]]",
    )
    .expect("valid source parenthetical regex")
});
static SOURCE_CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i),?\s*\b(?:on|see|from|in)?\s*(?:pp?\.|pages?)\s*\d+(?:\s*[-–,]\s*\d+)*")
        .expect("valid source clause regex")
});

#[derive(Debug, Deserialize)]
struct MetadataRecord {
    #[serde(default)]
    number: Option<u32>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    pages: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ProseRecord {
    #[serde(default)]
    number: Option<u32>,
    #[serde(default)]
    description: Option<String>,
}

trait Numbered {
    fn number(&self) -> Option<u32>;
}

impl Numbered for MetadataRecord {
    fn number(&self) -> Option<u32> {
        self.number
    }
}

impl Numbered for ProseRecord {
    fn number(&self) -> Option<u32> {
        self.number
    }
}

/// Pairs each citation with its answer record: by number first, then by position
/// for records that carry no number at all.
fn match_records<'r, R: Numbered>(
    batch: &[ParsedCitation],
    records: &'r [R],
) -> Vec<Option<&'r R>> {
    batch
        .iter()
        .enumerate()
        .map(|(position, citation)| {
            records
                .iter()
                .find(|r| r.number() == Some(citation.number))
                .or_else(|| records.get(position).filter(|r| r.number().is_none()))
        })
        .collect()
}

fn pages_from_value(value: &serde_json::Value) -> Vec<u32> {
    match value {
        serde_json::Value::Array(items) => {
            let mut pages = items
                .iter()
                .flat_map(|item| match item {
                    serde_json::Value::Number(n) => {
                        n.as_u64()
                            .and_then(|n| u32::try_from(n).ok())
                            .into_iter()
                            .collect::<Vec<_>>()
                    }
                    serde_json::Value::String(s) => parse_page_list(s),
                    _ => Vec::new(),
                })
                .collect::<Vec<_>>();
            pages.sort_unstable();
            pages.dedup();
            pages
        }
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .into_iter()
            .collect(),
        serde_json::Value::String(s) => parse_page_list(s),
        _ => Vec::new(),
    }
}

fn parse_records<T: for<'de> Deserialize<'de>>(raw: &str) -> anyhow::Result<Vec<T>> {
    let json = extract_json(raw).ok_or_else(|| anyhow::anyhow!("no JSON in healing answer"))?;
    Ok(serde_json::from_str(json)?)
}

/// Applies a metadata answer. Files outside the known sources are ignored.
fn apply_metadata(
    batch: &mut [ParsedCitation],
    records: &[MetadataRecord],
    sources: &[SourceListing],
) -> usize {
    let matched = match_records(batch, records);
    let mut updated = 0usize;
    for (citation, record) in batch.iter_mut().zip(matched) {
        let Some(record) = record else {
            continue;
        };
        let mut changed = false;
        if let Some(file) = record.file.as_deref().map(str::trim)
            && !file.is_empty()
            && (sources.is_empty() || sources.iter().any(|s| s.file == file))
        {
            citation.file = Some(file.to_owned());
            changed = true;
        }
        if let Some(pages) = record.pages.as_ref().map(pages_from_value)
            && !pages.is_empty()
        {
            citation.pages = pages;
            changed = true;
        }
        if changed {
            updated += 1;
        }
    }
    updated
}

fn apply_prose(batch: &mut [ParsedCitation], records: &[ProseRecord]) -> usize {
    let matched = match_records(batch, records);
    let mut updated = 0usize;
    for (citation, record) in batch.iter_mut().zip(matched) {
        let Some(description) = record.and_then(|r| r.description.as_deref()) else {
            continue;
        };
        let description = scrub_source_mentions(description, citation.file.as_deref());
        if !description.is_empty() {
            citation.description = description;
            updated += 1;
        }
    }
    updated
}

/// Removes file names and page references a rewritten description may still carry.
pub fn scrub_source_mentions(text: &str, file: Option<&str>) -> String {
    let mut text = SOURCE_PARENTHETICAL_RE.replace_all(text, "").into_owned();
    if let Some(file) = file
        && !file.is_empty()
        && let Ok(file_re) = Regex::new(&format!(
            r"(?i)\s*\b(?:in|from|of|see)?\s*{}",
            regex::escape(file)
        ))
    {
        text = file_re.replace_all(&text, "").into_owned();
    }
    let text = SOURCE_CLAUSE_RE.replace_all(&text, "");
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(" .", ".")
        .replace(" ,", ",")
}

impl Run<'_> {
    /// Heals citations in batches. Only a cost-ceiling violation is an error; any
    /// other failure leaves the batch as it was.
    pub(super) async fn heal_footnotes(
        &mut self,
        citations: &mut [ParsedCitation],
        sources: &[SourceListing],
    ) -> Result<(), GenerationError> {
        for (batch_index, batch) in citations.chunks_mut(FOOTNOTE_BATCH_SIZE).enumerate() {
            let metadata = self
                .call(
                    Stage::FootnoteMetadata,
                    prompts::footnote_metadata(batch, sources),
                    HEALING_MAX_OUTPUT_TOKENS,
                )
                .await;
            if let Some(records) =
                healing_answer::<MetadataRecord>(metadata, batch_index, Stage::FootnoteMetadata)?
            {
                let updated = apply_metadata(batch, &records, sources);
                tracing::debug!(batch = batch_index, updated, "footnote metadata healed");
            }

            let prose = self
                .call(
                    Stage::FootnoteProse,
                    prompts::footnote_prose(batch),
                    HEALING_MAX_OUTPUT_TOKENS,
                )
                .await;
            if let Some(records) =
                healing_answer::<ProseRecord>(prose, batch_index, Stage::FootnoteProse)?
            {
                let updated = apply_prose(batch, &records);
                tracing::debug!(batch = batch_index, updated, "footnote prose healed");
            }
        }
        Ok(())
    }
}

fn healing_answer<T: for<'de> Deserialize<'de>>(
    answer: Result<String, LlmError>,
    batch: usize,
    stage: Stage,
) -> Result<Option<Vec<T>>, GenerationError> {
    let raw = match answer {
        Ok(raw) => raw,
        Err(err) if err.is_cost_exceeded() => return Err(err.into()),
        Err(err) => {
            tracing::warn!(batch, %stage, error = %format!("{err:#}"), "footnote healing call failed; keeping batch");
            return Ok(None);
        }
    };
    match parse_records::<T>(&raw) {
        Ok(records) => Ok(Some(records)),
        Err(err) => {
            tracing::warn!(batch, %stage, error = %format!("{err:#}"), "footnote healing answer unusable; keeping batch");
            Ok(None)
        }
    }
}
