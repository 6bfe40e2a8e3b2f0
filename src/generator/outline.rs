use serde::{Deserialize, Serialize};

use crate::markdown::{self, Node, NodeKind};

/// Title prefixes left behind by the outline template.
const TEMPLATE_PREFIXES: &[&str] = &[
    "structural schema for:",
    "structural schema:",
    "document title:",
    "outline for:",
    "outline:",
    "title:",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialLength {
    Short,
    Medium,
    Long,
}

impl MaterialLength {
    /// Length class of a lecture, by transcript word count.
    pub fn from_transcript(transcript: &str) -> Self {
        match transcript.split_whitespace().count() {
            0..2_000 => Self::Short,
            2_000..6_000 => Self::Medium,
            _ => Self::Long,
        }
    }

    pub fn policy(self) -> SectionPolicy {
        match self {
            Self::Short => SectionPolicy {
                minimum: 1,
                maximum: 4,
                preferred: 3,
            },
            Self::Medium => SectionPolicy {
                minimum: 2,
                maximum: 5,
                preferred: 4,
            },
            Self::Long => SectionPolicy {
                minimum: 4,
                maximum: 7,
                preferred: 6,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPolicy {
    pub minimum: usize,
    pub maximum: usize,
    pub preferred: usize,
}

impl SectionPolicy {
    pub fn accepts(&self, sections: usize) -> bool {
        (self.minimum..=self.maximum).contains(&sections)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub title: String,
    pub coverage: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outline {
    pub title: String,
    pub sections: Vec<Section>,
    /// Outline text as answered by the model, repeated in every section request.
    pub text: String,
}

impl Outline {
    /// Replaces the title, in the outline text too when it occurs there verbatim.
    pub fn retitle(&mut self, title: &str) {
        if title == self.title {
            return;
        }
        if !self.title.is_empty() && self.text.contains(&self.title) {
            self.text = self.text.replace(&self.title, title);
        }
        self.title = title.to_owned();
    }
}

/// Parses an outline answer.
///
/// A single level-1 heading is the title and its subsections are the outline
/// sections. Without one, the shallowest headings are the sections and the title
/// falls back to `title_hint`.
pub fn parse_outline(text: &str, title_hint: Option<&str>) -> Outline {
    let tree = markdown::parse(text);
    let top = tree.sections().collect::<Vec<_>>();

    let (title, sections) = match top.as_slice() {
        [root] if root.level == 1 => {
            (root.content.clone(), root.sections().collect::<Vec<_>>())
        }
        _ => {
            let title = title_hint.unwrap_or("Study Guide").to_owned();
            (title, top.clone())
        }
    };

    Outline {
        title,
        sections: sections
            .into_iter()
            .map(|section| Section {
                title: section.content.trim().to_owned(),
                coverage: coverage_text(section),
            })
            .collect(),
        text: text.trim().to_owned(),
    }
}

fn coverage_text(section: &Node) -> String {
    let body = Node::document(
        section
            .children
            .iter()
            .filter(|child| child.kind != NodeKind::Heading)
            .cloned()
            .collect(),
    );
    markdown::reconstruct(&body).trim().to_owned()
}

/// Strips template wording, markdown emphasis and quotes from a title.
pub fn strip_template_artifacts(raw: &str) -> String {
    let mut title = raw.trim();
    loop {
        let before = title;
        title = title
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, '#' | '*' | '_' | '"' | '\'' | '`'));
        let lower = title.to_ascii_lowercase();
        if let Some(prefix) = TEMPLATE_PREFIXES.iter().find(|p| lower.starts_with(**p)) {
            title = &title[prefix.len()..];
        }
        if title == before {
            break;
        }
    }
    title.to_owned()
}

/// Picks the model's title-cleaning answer if it is usable.
pub fn cleaned_title(answer: &str, fallback: &str) -> String {
    let candidate = answer
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(strip_template_artifacts)
        .unwrap_or_default();
    if candidate.is_empty() || candidate.chars().count() > 200 {
        fallback.to_owned()
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_title_and_sections_come_from_headings() {
        let outline = parse_outline(
            "# Structural Schema for: Cell Biology\n\n## Membranes\n\nLipid bilayer.\n\n## Transport\n\nPumps.\n\n- channels\n",
            None,
        );
        assert_eq!(outline.title, "Structural Schema for: Cell Biology");
        assert_eq!(outline.sections.len(), 2);
        assert_eq!(outline.sections[0].title, "Membranes");
        assert_eq!(outline.sections[1].coverage, "Pumps.\n\n- channels");
    }

    #[test]
    fn outline_without_title_uses_hint() {
        let outline = parse_outline("## One\n\na\n\n## Two\n\nb\n\n## Three\n\nc\n", Some("Genetics"));
        assert_eq!(outline.title, "Genetics");
        assert_eq!(outline.sections.len(), 3);
    }

    #[test]
    fn retitle_substitutes_verbatim_occurrences() {
        let mut outline = parse_outline("# Outline: Optics\n\n## Lenses\n\nfocal length\n", None);
        outline.retitle("Optics");
        assert_eq!(outline.title, "Optics");
        assert!(outline.text.starts_with("# Optics\n"));
    }

    #[test]
    fn template_prefixes_are_stripped() {
        assert_eq!(
            strip_template_artifacts("**Structural Schema for: \"Thermodynamics\"**"),
            "Thermodynamics"
        );
        assert_eq!(strip_template_artifacts("Title: Outline: Waves"), "Waves");
        assert_eq!(strip_template_artifacts("Plain"), "Plain");
        assert_eq!(cleaned_title("\n  \n", "Fallback"), "Fallback");
        assert_eq!(cleaned_title("# Entropy\nextra", "Fallback"), "Entropy");
    }

    #[test]
    fn length_policies_bound_section_counts() {
        assert_eq!(MaterialLength::from_transcript("a few words"), MaterialLength::Short);
        assert_eq!(
            MaterialLength::from_transcript(&"word ".repeat(3_000)),
            MaterialLength::Medium
        );
        let long = MaterialLength::Long.policy();
        assert!(!long.accepts(3));
        assert!(long.accepts(4) && long.accepts(7));
        assert!(!long.accepts(8));
        assert!(MaterialLength::Short.policy().accepts(1));
    }
}
