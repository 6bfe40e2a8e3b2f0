//! Documents matching: an ensemble of model calls nominates the reference pages a
//! transcript covers, and the union of their answers filters the material tree.

use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::Context as _;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::generator::GenerationError;
use crate::generator::prompts;
use crate::llm::{ChatRequest, LlmClient, LlmError, Stage, Usage, extract_json};
use crate::markdown::{Node, NodeKind};

/// Ranges closer than this many pages are merged into one.
pub const MERGE_GAP: u32 = 6;

static FILE_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^File:\s*(.+?)\s*$").expect("valid file heading regex"));
static PAGE_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Page\s+(\d{1,9})\s*$").expect("valid page heading regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn contains(&self, page: u32) -> bool {
        (self.start..=self.end).contains(&page)
    }
}

/// One page of a reference document, as handed to the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePage {
    pub file: String,
    pub number: u32,
    pub text: String,
    pub image_path: Option<PathBuf>,
}

/// Pages available per file, listed for the footnote reconciliation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceListing {
    pub file: String,
    pub pages: Vec<u32>,
}

/// Sorts the ranges and merges neighbours whose gap is at most [`MERGE_GAP`].
pub fn merge_ranges(ranges: impl IntoIterator<Item = PageRange>) -> Vec<PageRange> {
    let mut ranges = ranges
        .into_iter()
        .map(|r| PageRange::new(r.start, r.end))
        .collect::<Vec<_>>();
    ranges.sort_by_key(|r| (r.start, r.end));

    let mut merged: Vec<PageRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(current) if range.start.saturating_sub(current.end) <= MERGE_GAP => {
                current.end = current.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RangesAnswer {
    Bare(Vec<RangeItem>),
    Wrapped { ranges: Vec<RangeItem> },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RangeItem {
    Object { start: u32, end: Option<u32> },
    Pair([u32; 2]),
    Single(u32),
}

impl From<RangeItem> for PageRange {
    fn from(item: RangeItem) -> Self {
        match item {
            RangeItem::Object { start, end } => PageRange::new(start, end.unwrap_or(start)),
            RangeItem::Pair([start, end]) => PageRange::new(start, end),
            RangeItem::Single(page) => PageRange::new(page, page),
        }
    }
}

pub fn parse_ranges(raw: &str) -> anyhow::Result<Vec<PageRange>> {
    let json = extract_json(raw).context("no JSON in documents-matching answer")?;
    let answer: RangesAnswer =
        serde_json::from_str(json).context("parse documents-matching answer")?;
    let items = match answer {
        RangesAnswer::Bare(ranges) => ranges,
        RangesAnswer::Wrapped { ranges } => ranges,
    };
    Ok(items.into_iter().map(PageRange::from).collect())
}

/// Runs the documents-matching ensemble and returns the merged ranges.
///
/// At most `concurrency` calls are in flight. Failed runs are tolerated as long as one
/// run succeeds; a cost-ceiling violation aborts the whole ensemble.
pub async fn match_documents(
    llm: &LlmClient,
    model: &str,
    transcript: &str,
    material: &str,
    runs: usize,
    concurrency: usize,
) -> Result<(Vec<PageRange>, Usage), GenerationError> {
    let runs = runs.max(1);
    let concurrency = concurrency.clamp(1, runs);
    let messages = prompts::documents_matching(transcript, material);

    let mut join_set = tokio::task::JoinSet::new();
    let mut next_run = 0usize;
    let mut ranges = Vec::new();
    let mut usage = Usage::default();
    let mut succeeded = 0usize;
    let mut last_error: Option<LlmError> = None;

    while next_run < runs || !join_set.is_empty() {
        while next_run < runs && join_set.len() < concurrency {
            let run = next_run;
            let llm = llm.clone();
            let request = ChatRequest::new(model, messages.clone()).with_max_output_tokens(1024);
            join_set.spawn(async move {
                tracing::debug!(run, "documents matching run");
                let answer = llm.complete(Stage::DocumentsMatching, request).await;
                (run, answer)
            });
            next_run += 1;
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let (run, answer) = match joined {
            Ok(joined) => joined,
            Err(err) => {
                tracing::warn!(error = %err, "documents matching task panicked");
                last_error = Some(LlmError::Provider {
                    stage: Stage::DocumentsMatching,
                    source: anyhow::Error::new(err),
                });
                continue;
            }
        };

        let response = match answer {
            Ok(response) => response,
            Err(err) if err.is_cost_exceeded() => {
                join_set.abort_all();
                return Err(err.into());
            }
            Err(err) => {
                tracing::warn!(run, error = %format!("{err:#}"), "documents matching run failed");
                last_error = Some(err);
                continue;
            }
        };
        usage.add(&response.usage);

        match parse_ranges(&response.text) {
            Ok(found) => {
                tracing::debug!(run, ranges = found.len(), "documents matching run answered");
                ranges.extend(found);
                succeeded += 1;
            }
            Err(err) => {
                tracing::warn!(run, error = %format!("{err:#}"), "documents matching answer unusable");
                last_error = Some(LlmError::Provider {
                    stage: Stage::DocumentsMatching,
                    source: err,
                });
            }
        }
    }

    if succeeded == 0 {
        return Err(GenerationError::MatchingFailed {
            runs,
            source: last_error.unwrap_or_else(|| LlmError::Provider {
                stage: Stage::DocumentsMatching,
                source: anyhow::anyhow!("no run completed"),
            }),
        });
    }

    let merged = merge_ranges(ranges);
    tracing::info!(runs, succeeded, ranges = ?merged, "documents matching merged");
    Ok((merged, usage))
}

/// Builds the material tree: one `# File: name` section per file and one
/// `## Page N` section per page, files in first-seen order.
pub fn build_material_tree(pages: &[ReferencePage]) -> Node {
    let mut files: Vec<Node> = Vec::new();
    for page in pages {
        let title = format!("File: {}", page.file);
        let position = match files.iter().position(|f| f.content == title) {
            Some(position) => position,
            None => {
                files.push(Node::section(1, title));
                files.len() - 1
            }
        };

        let mut section = Node::section(2, format!("Page {}", page.number));
        for block in page.text.split("\n\n") {
            let block = escape_block(block.trim());
            if !block.is_empty() {
                section.children.push(Node::paragraph(block));
            }
        }
        files[position].children.push(section);
    }
    Node::document(files)
}

/// Page text must not open headings, footnotes or lists of its own.
fn escape_block(block: &str) -> String {
    block
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let opens_block = trimmed.starts_with('#')
                || trimmed.starts_with("[^")
                || trimmed.starts_with("```")
                || trimmed.starts_with("~~~")
                || trimmed.starts_with("- ")
                || trimmed.starts_with("* ")
                || trimmed.starts_with("+ ");
            if opens_block {
                format!("\\{trimmed}")
            } else {
                trimmed.to_owned()
            }
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn file_name(section: &Node) -> Option<&str> {
    FILE_HEADING_RE
        .captures(&section.content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn page_number(section: &Node) -> Option<u32> {
    PAGE_HEADING_RE
        .captures(&section.content)
        .and_then(|caps| caps[1].parse().ok())
}

/// Keeps only the pages intersecting `ranges`. Files left without pages are dropped.
pub fn filter_material(material: &Node, ranges: &[PageRange]) -> Node {
    let mut files = Vec::new();
    for file in material.sections() {
        let mut kept = Node {
            children: Vec::new(),
            ..file.clone()
        };
        let mut pages = 0usize;
        for child in &file.children {
            match child.kind {
                NodeKind::Section => {
                    let Some(number) = page_number(child) else {
                        continue;
                    };
                    if ranges.iter().any(|r| r.contains(number)) {
                        kept.children.push(child.clone());
                        pages += 1;
                    }
                }
                _ => kept.children.push(child.clone()),
            }
        }
        if pages > 0 {
            files.push(kept);
        }
    }
    Node::document(files)
}

pub fn source_listing(material: &Node) -> Vec<SourceListing> {
    material
        .sections()
        .filter_map(|file| {
            let name = file_name(file)?;
            let pages = file.sections().filter_map(page_number).collect::<Vec<_>>();
            Some(SourceListing {
                file: name.to_owned(),
                pages,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markdown::{parse, reconstruct};

    fn pages() -> Vec<ReferencePage> {
        let page = |file: &str, number: u32, text: &str| ReferencePage {
            file: file.to_owned(),
            number,
            text: text.to_owned(),
            image_path: None,
        };
        vec![
            page("bio.pdf", 1, "Cells"),
            page("bio.pdf", 2, "# Mitosis\n\nProphase first."),
            page("bio.pdf", 20, "Ecology"),
            page("chem.pdf", 2, "Bonds"),
        ]
    }

    #[test]
    fn nearby_ranges_merge_within_gap() {
        let merged = merge_ranges([
            PageRange::new(12, 15),
            PageRange::new(1, 2),
            PageRange::new(4, 6),
        ]);
        assert_eq!(merged, vec![PageRange::new(1, 15)]);
    }

    #[test]
    fn distant_ranges_stay_separate() {
        let merged = merge_ranges([PageRange::new(40, 50), PageRange::new(1, 10)]);
        assert_eq!(merged, vec![PageRange::new(1, 10), PageRange::new(40, 50)]);
        assert!(merge_ranges([]).is_empty());
        assert_eq!(
            merge_ranges([PageRange::new(5, 3), PageRange::new(4, 9)]),
            vec![PageRange::new(3, 9)]
        );
    }

    #[test]
    fn answers_parse_in_several_shapes() -> anyhow::Result<()> {
        assert_eq!(
            parse_ranges("Here: {\"ranges\": [{\"start\": 3, \"end\": 1}, {\"start\": 9}]}")?,
            vec![PageRange::new(1, 3), PageRange::new(9, 9)]
        );
        assert_eq!(
            parse_ranges("[[2, 4], 7]")?,
            vec![PageRange::new(2, 4), PageRange::new(7, 7)]
        );
        assert!(parse_ranges("{\"ranges\": []}")?.is_empty());
        assert!(parse_ranges("none").is_err());
        Ok(())
    }

    #[test]
    fn material_tree_escapes_page_text_and_round_trips() {
        let tree = build_material_tree(&pages());
        let text = reconstruct(&tree);
        assert!(text.starts_with("# File: bio.pdf\n\n## Page 1\n\nCells\n\n## Page 2\n\n\\# Mitosis"));
        assert_eq!(reconstruct(&parse(&text)), text);
        assert_eq!(parse(&text).sections().count(), 2);
    }

    #[test]
    fn filter_keeps_only_pages_in_range() {
        let tree = build_material_tree(&pages());
        let filtered = filter_material(&tree, &[PageRange::new(2, 3)]);
        let text = reconstruct(&filtered);
        assert!(text.contains("## Page 2\n\n\\# Mitosis"));
        assert!(text.contains("# File: chem.pdf\n\n## Page 2\n\nBonds"));
        assert!(!text.contains("Cells"));
        assert!(!text.contains("Ecology"));

        assert!(filter_material(&tree, &[PageRange::new(100, 120)]).children.is_empty());
    }

    #[test]
    fn listing_reports_pages_per_file() {
        let listing = source_listing(&build_material_tree(&pages()));
        assert_eq!(
            listing,
            vec![
                SourceListing {
                    file: "bio.pdf".to_owned(),
                    pages: vec![1, 2, 20],
                },
                SourceListing {
                    file: "chem.pdf".to_owned(),
                    pages: vec![2],
                },
            ]
        );
    }
}
