use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Node, NodeKind};

/// Inline citation marker emitted by the section prompts:
/// `{{cite: description; file: name.pdf; pages: 3-4}}`.
static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{\s*cite:\s*(.*?)\}\}").expect("valid marker regex"));
static FOOTNOTE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\^(\d{1,9})\]").expect("valid footnote ref regex"));
static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([A-Za-z0-9_][\w\-. ]*?\.(?:pdf|pptx?|docx?|md|txt))\b")
        .expect("valid file regex")
});
static PAGES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:pp?\.|pages?)\s*(\d+(?:\s*[-–]\s*\d+)?(?:\s*,\s*\d+(?:\s*[-–]\s*\d+)?)*)")
        .expect("valid pages regex")
});

const MAX_RANGE_SPAN: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCitation {
    pub number: u32,
    pub description: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub pages: Vec<u32>,
}

/// Replaces inline citation markers with `[^N]` references.
///
/// Numbering continues after the highest footnote reference already present, and a
/// marker repeating an earlier citation verbatim reuses its number.
pub fn parse_citations(text: &str) -> (String, Vec<ParsedCitation>) {
    let mut next_number = FOOTNOTE_REF_RE
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1;

    let mut out = String::with_capacity(text.len());
    let mut citations: Vec<ParsedCitation> = Vec::new();
    let mut seen: HashMap<(String, Option<String>, Vec<u32>), u32> = HashMap::new();
    let mut last = 0usize;

    for caps in MARKER_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(text[last..whole.start()].trim_end_matches([' ', '\t']));
        last = whole.end();

        let (description, file, pages) = parse_marker_body(&caps[1]);
        let key = (description.clone(), file.clone(), pages.clone());
        let number = match seen.get(&key) {
            Some(number) => *number,
            None => {
                let number = next_number;
                next_number += 1;
                seen.insert(key, number);
                citations.push(ParsedCitation {
                    number,
                    description,
                    file,
                    pages,
                });
                number
            }
        };
        out.push_str(&format!("[^{number}]"));
    }
    out.push_str(&text[last..]);

    (out, citations)
}

fn parse_marker_body(body: &str) -> (String, Option<String>, Vec<u32>) {
    let mut description = Vec::new();
    let mut file = None;
    let mut pages = Vec::new();

    for part in body.split(';') {
        let part = part.trim();
        let lower = part.to_ascii_lowercase();
        if lower.starts_with("file:") {
            let value = part["file:".len()..].trim();
            if !value.is_empty() {
                file = Some(value.to_owned());
            }
        } else if lower.starts_with("pages:") || lower.starts_with("page:") {
            let value = part.split_once(':').map(|(_, v)| v).unwrap_or_default();
            pages = parse_page_list(value);
        } else if !part.is_empty() {
            description.push(part);
        }
    }

    let description = description.join("; ");
    if file.is_none() {
        file = FILE_RE
            .captures(&description)
            .map(|caps| caps[1].trim().to_owned());
    }
    if pages.is_empty()
        && let Some(caps) = PAGES_RE.captures(&description)
    {
        pages = parse_page_list(&caps[1]);
    }

    (description, file, pages)
}

/// Parses `3`, `3, 5`, `3-5`, `p. 3–4` style page lists into sorted unique numbers.
pub fn parse_page_list(raw: &str) -> Vec<u32> {
    let mut pages = Vec::new();
    for part in raw.split(',') {
        let digits = part
            .trim()
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .trim();
        let (start, end) = match digits.split_once(['-', '–']) {
            Some((a, b)) => (a.trim().parse::<u32>(), b.trim().parse::<u32>()),
            None => {
                let n = digits.parse::<u32>();
                (n.clone(), n)
            }
        };
        let (Ok(start), Ok(end)) = (start, end) else {
            continue;
        };
        let (start, end) = if start <= end {
            (start, end)
        } else {
            (end, start)
        };
        pages.extend(start..=end.min(start.saturating_add(MAX_RANGE_SPAN)));
    }
    pages.sort_unstable();
    pages.dedup();
    pages
}

pub fn format_page_list(pages: &[u32]) -> String {
    pages
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Makes the tree's footnotes agree with `citations`, matched by number.
///
/// Existing footnote nodes take the record's description and source; records with
/// no footnote in the tree are appended to the document as new footnote nodes.
pub fn bind_citations(tree: &mut Node, citations: &[ParsedCitation]) {
    let by_number = citations
        .iter()
        .map(|c| (c.number, c))
        .collect::<HashMap<_, _>>();
    let mut bound = Vec::new();

    tree.walk_mut(&mut |node| {
        if node.kind != NodeKind::Footnote {
            return;
        }
        let Some(citation) = node.footnote_number.and_then(|n| by_number.get(&n)) else {
            return;
        };
        node.content = citation.description.clone();
        node.source_file = citation.file.clone();
        node.source_pages = citation.pages.clone();
        bound.push(citation.number);
    });

    for citation in citations {
        if bound.contains(&citation.number) {
            continue;
        }
        let mut node = Node::footnote(citation.number, citation.description.clone());
        node.source_file = citation.file.clone();
        node.source_pages = citation.pages.clone();
        tree.children.push(node);
    }
}

/// Attaches the image of the first resolvable cited page to each footnote.
///
/// Returns how many footnotes received an image.
pub fn enrich_with_cited_images<F>(tree: &mut Node, resolver: F) -> usize
where
    F: Fn(&str, u32) -> Option<PathBuf>,
{
    let mut enriched = 0usize;
    tree.walk_mut(&mut |node| {
        if node.kind != NodeKind::Footnote {
            return;
        }
        let Some(file) = node.source_file.as_deref() else {
            return;
        };
        if let Some(path) = node.source_pages.iter().find_map(|page| resolver(file, *page)) {
            node.image_path = Some(path);
            enriched += 1;
        }
    });
    enriched
}
