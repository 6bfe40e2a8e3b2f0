//! Markdown document tree shared by transcripts, reference material, generated
//! sections and export content.
//!
//! The tree is block-level only: headings open sections that extend until the next
//! heading of the same or a shallower level, and every other block (paragraph,
//! list item, footnote definition) hangs off the innermost open section.
//! [`reconstruct`] renders canonical text, and `parse(reconstruct(tree))` renders
//! back to the same text.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod citations;

pub use citations::{
    ParsedCitation, bind_citations, enrich_with_cited_images, format_page_list, parse_citations,
    parse_page_list,
};

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})[ \t]+(.*\S)\s*$").expect("valid heading regex"));
static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([ \t]*)(?:[-*+]|\d{1,9}[.)])[ \t]+\S").expect("valid list item regex")
});
static FOOTNOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\^(\d{1,9})\]:[ \t]*(.*)$").expect("valid footnote regex"));
static SOURCE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)\s*<!--\s*source:\s*(.*?)\s*-->\s*$").expect("valid source comment regex")
});
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^!\[[^\]]*\]\(([^)]+)\)$").expect("valid image regex"));

const FOOTNOTE_INDENT: &str = "    ";
const LIST_CONTINUATION_INDENT: &str = "  ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Document,
    Section,
    Heading,
    Paragraph,
    ListItem,
    Footnote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub level: u8,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footnote_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_pages: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
}

impl Node {
    fn leaf(kind: NodeKind, level: u8, content: impl Into<String>) -> Self {
        Self {
            kind,
            level,
            content: content.into(),
            children: Vec::new(),
            footnote_number: None,
            source_file: None,
            source_pages: Vec::new(),
            image_path: None,
        }
    }

    pub fn document(children: Vec<Node>) -> Self {
        let mut node = Self::leaf(NodeKind::Document, 0, "");
        node.children = children;
        node
    }

    /// A section whose first child is its heading.
    pub fn section(level: u8, title: impl Into<String>) -> Self {
        let title = title.into();
        let mut node = Self::leaf(NodeKind::Section, level, title.clone());
        node.children.push(Self::heading(level, title));
        node
    }

    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Self::leaf(NodeKind::Heading, level.clamp(1, 6), text)
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::leaf(NodeKind::Paragraph, 0, text)
    }

    pub fn list_item(level: u8, text: impl Into<String>) -> Self {
        Self::leaf(NodeKind::ListItem, level, text)
    }

    pub fn footnote(number: u32, text: impl Into<String>) -> Self {
        let mut node = Self::leaf(NodeKind::Footnote, 0, text);
        node.footnote_number = Some(number);
        node
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Direct child sections.
    pub fn sections(&self) -> impl Iterator<Item = &Node> {
        self.children
            .iter()
            .filter(|child| child.kind == NodeKind::Section)
    }

    /// Body blocks of a section: everything but its heading and nested sections.
    pub fn body(&self) -> impl Iterator<Item = &Node> {
        self.children
            .iter()
            .filter(|child| !matches!(child.kind, NodeKind::Heading | NodeKind::Section))
    }

    /// Depth-first pre-order walk.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Node)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Node)) {
        f(self);
        for child in &mut self.children {
            child.walk_mut(f);
        }
    }

    pub fn footnotes(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if node.kind == NodeKind::Footnote {
                out.push(node);
            }
        });
        out
    }

    /// Shifts this section (and everything nested in it) so that it sits at `level`.
    pub fn relevel(&mut self, level: u8) {
        let delta = i16::from(level) - i16::from(self.level);
        if delta == 0 {
            return;
        }
        self.walk_mut(&mut |node| {
            if matches!(node.kind, NodeKind::Section | NodeKind::Heading) {
                node.level = (i16::from(node.level) + delta).clamp(1, 6) as u8;
            }
        });
    }
}

/// Title of the first level-1 section, if any.
pub fn document_title(tree: &Node) -> Option<&str> {
    tree.sections()
        .find(|section| section.level == 1)
        .map(|section| section.content.as_str())
}

pub fn parse(text: &str) -> Node {
    let mut stack = vec![Node::document(Vec::new())];

    for block in parse_blocks(text) {
        if block.kind != NodeKind::Heading {
            if let Some(top) = stack.last_mut() {
                top.children.push(block);
            }
            continue;
        }

        while stack.len() > 1
            && stack
                .last()
                .is_some_and(|open| open.kind == NodeKind::Section && open.level >= block.level)
        {
            close_top(&mut stack);
        }

        let mut section = Node::leaf(NodeKind::Section, block.level, block.content.clone());
        section.children.push(block);
        stack.push(section);
    }

    while stack.len() > 1 {
        close_top(&mut stack);
    }
    stack.pop().unwrap_or_else(|| Node::document(Vec::new()))
}

fn close_top(stack: &mut Vec<Node>) {
    if let Some(done) = stack.pop()
        && let Some(parent) = stack.last_mut()
    {
        parent.children.push(done);
    }
}

fn parse_blocks(text: &str) -> Vec<Node> {
    let lines = text.lines().collect::<Vec<_>>();
    let mut blocks = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        if line.trim().is_empty() {
            i += 1;
            continue;
        }

        if let Some(caps) = HEADING_RE.captures(line) {
            blocks.push(Node::heading(caps[1].len() as u8, &caps[2]));
            i += 1;
            continue;
        }

        if let Some(fence) = fence_marker(line) {
            let start = i;
            i += 1;
            while i < lines.len() {
                let closes = lines[i].trim_start().starts_with(fence);
                i += 1;
                if closes {
                    break;
                }
            }
            blocks.push(Node::paragraph(lines[start..i].join("\n")));
            continue;
        }

        if let Some(mut node) = parse_footnote_line(line) {
            i += 1;
            while i < lines.len()
                && lines[i].starts_with(FOOTNOTE_INDENT)
                && !lines[i].trim().is_empty()
            {
                let continuation = lines[i].trim();
                match IMAGE_RE.captures(continuation) {
                    Some(caps) => node.image_path = Some(PathBuf::from(&caps[1])),
                    None => {
                        node.content.push('\n');
                        node.content.push_str(continuation);
                    }
                }
                i += 1;
            }
            blocks.push(node);
            continue;
        }

        if let Some(level) = list_item_level(line) {
            let mut content = line.trim_start().to_owned();
            i += 1;
            while i < lines.len() && is_list_continuation(lines[i]) {
                content.push('\n');
                content.push_str(lines[i].trim());
                i += 1;
            }
            blocks.push(Node::list_item(level, content));
            continue;
        }

        let start = i;
        i += 1;
        while i < lines.len() && !starts_block(lines[i]) {
            i += 1;
        }
        blocks.push(Node::paragraph(lines[start..i].join("\n")));
    }

    blocks
}

fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn list_item_level(line: &str) -> Option<u8> {
    let caps = LIST_ITEM_RE.captures(line)?;
    let indent = caps[1]
        .chars()
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum::<usize>();
    Some((indent / 2).min(u8::MAX as usize) as u8)
}

fn is_list_continuation(line: &str) -> bool {
    !line.trim().is_empty()
        && line.starts_with(LIST_CONTINUATION_INDENT)
        && list_item_level(line).is_none()
}

fn starts_block(line: &str) -> bool {
    line.trim().is_empty()
        || HEADING_RE.is_match(line)
        || fence_marker(line).is_some()
        || FOOTNOTE_RE.is_match(line)
        || list_item_level(line).is_some()
}

fn parse_footnote_line(line: &str) -> Option<Node> {
    let caps = FOOTNOTE_RE.captures(line)?;
    let number = caps[1].parse::<u32>().ok()?;
    let rest = caps[2].trim();

    let Some(source) = SOURCE_COMMENT_RE.captures(rest) else {
        return Some(Node::footnote(number, rest));
    };
    let mut node = Node::footnote(number, source[1].trim());
    let (file, pages) = match source[2].split_once(';') {
        Some((file, pages)) => (
            file.trim(),
            pages.trim().trim_start_matches("pages:").trim(),
        ),
        None => (source[2].trim(), ""),
    };
    if !file.is_empty() {
        node.source_file = Some(file.to_owned());
    }
    node.source_pages = parse_page_list(pages);
    Some(node)
}

pub fn reconstruct(tree: &Node) -> String {
    let mut blocks = Vec::new();
    flatten(tree, &mut blocks);

    let mut out = String::new();
    let mut prev: Option<NodeKind> = None;
    for (kind, text) in blocks {
        if let Some(prev) = prev {
            let tight = matches!(
                (prev, kind),
                (NodeKind::ListItem, NodeKind::ListItem) | (NodeKind::Footnote, NodeKind::Footnote)
            );
            out.push_str(if tight { "\n" } else { "\n\n" });
        }
        out.push_str(&text);
        prev = Some(kind);
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn flatten(node: &Node, out: &mut Vec<(NodeKind, String)>) {
    match node.kind {
        NodeKind::Document => {
            for child in &node.children {
                flatten(child, out);
            }
        }
        NodeKind::Section => {
            if node.children.first().map(|c| c.kind) != Some(NodeKind::Heading) {
                out.push((NodeKind::Heading, render_heading(node.level, &node.content)));
            }
            for child in &node.children {
                flatten(child, out);
            }
        }
        NodeKind::Heading => out.push((node.kind, render_heading(node.level, &node.content))),
        NodeKind::Paragraph => out.push((node.kind, node.content.clone())),
        NodeKind::ListItem => out.push((node.kind, render_list_item(node))),
        NodeKind::Footnote => out.push((node.kind, render_footnote(node))),
    }
}

fn render_heading(level: u8, text: &str) -> String {
    format!("{} {}", "#".repeat(usize::from(level.clamp(1, 6))), text.trim())
}

fn render_list_item(node: &Node) -> String {
    let indent = "  ".repeat(usize::from(node.level));
    let mut lines = node.content.lines();
    let mut out = format!("{indent}{}", lines.next().unwrap_or_default());
    for line in lines {
        out.push('\n');
        out.push_str(&indent);
        out.push_str(LIST_CONTINUATION_INDENT);
        out.push_str(line.trim());
    }
    out
}

fn render_footnote(node: &Node) -> String {
    let mut lines = node.content.lines();
    let first = lines.next().unwrap_or_default().trim();

    let mut out = format!("[^{}]:", node.footnote_number.unwrap_or_default());
    if !first.is_empty() {
        out.push(' ');
        out.push_str(first);
    }
    if let Some(file) = node.source_file.as_deref() {
        if node.source_pages.is_empty() {
            out.push_str(&format!(" <!-- source: {file} -->"));
        } else {
            out.push_str(&format!(
                " <!-- source: {file}; pages: {} -->",
                format_page_list(&node.source_pages)
            ));
        }
    }
    for line in lines {
        out.push('\n');
        out.push_str(FOOTNOTE_INDENT);
        out.push_str(line.trim());
    }
    if let Some(path) = &node.image_path {
        out.push('\n');
        out.push_str(FOOTNOTE_INDENT);
        out.push_str(&format!("![Source page]({})", path.display()));
    }
    out
}
