use std::sync::LazyLock;

use regex::Regex;

use crate::generator::outline::{Outline, Section};
use crate::generator::{GenerationError, Run, prompts};
use crate::llm::{Message, Stage};
use crate::markdown::{self, Node};

/// Drafts whose heading is less similar than this to the planned title are retried
/// without an adherence check.
pub const TITLE_SIMILARITY_THRESHOLD: u8 = 65;

const SECTION_MAX_OUTPUT_TOKENS: u32 = 4096;
const ADHERENCE_MAX_OUTPUT_TOKENS: u32 = 64;

static NUMBERING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:section|chapter|part)\s+)?\d+(?:\.\d+)*[.):]?\s+")
        .expect("valid numbering regex")
});
static SCORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bscore\b\W{0,3}(\d{1,3})\b").expect("valid score regex")
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3})\b").expect("valid number regex"));

#[derive(Debug, Clone)]
pub struct AcceptedSection {
    pub title: String,
    pub node: Node,
    /// Canonical text of `node`, fed back into the clean history.
    pub text: String,
    pub score: u8,
    pub attempts: u32,
    pub forced: bool,
}

fn normalize_title(title: &str) -> String {
    let lower = title.trim().to_lowercase();
    let unnumbered = NUMBERING_RE.replace(&lower, "");
    unnumbered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized Levenshtein similarity of two titles, 0 to 100.
pub fn title_similarity(actual: &str, expected: &str) -> u8 {
    let similarity = strsim::normalized_levenshtein(&normalize_title(actual), &normalize_title(expected));
    (similarity * 100.0).round().clamp(0.0, 100.0) as u8
}

pub fn parse_adherence_score(raw: &str) -> Option<u8> {
    let caps = SCORE_RE
        .captures(raw)
        .or_else(|| NUMBER_RE.captures(raw))?;
    let score = caps[1].parse::<u16>().ok()?;
    (score <= 100).then_some(score as u8)
}

/// Turns a section draft into a level-2 section node.
///
/// The first heading opens the section; any further top-level sections nest under
/// it. Text before the first heading is model chatter and is dropped. A draft with
/// no heading at all is filed under `expected_title`.
pub fn draft_section(draft: &str, expected_title: &str) -> Node {
    let tree = markdown::parse(draft);
    let (sections, preamble): (Vec<Node>, Vec<Node>) = tree
        .children
        .into_iter()
        .partition(|child| child.kind == markdown::NodeKind::Section);

    let mut sections = sections.into_iter();
    let Some(mut first) = sections.next() else {
        let mut section = Node::section(2, expected_title);
        section.children.extend(preamble);
        return section;
    };
    first.relevel(2);
    for mut extra in sections {
        extra.relevel(3);
        first.children.push(extra);
    }
    first
}

fn retitle(section: &mut Node, title: &str) {
    section.content = title.to_owned();
    if let Some(heading) = section.children.first_mut()
        && heading.kind == markdown::NodeKind::Heading
    {
        heading.content = title.to_owned();
    }
}

/// Conversation for one section request: the shared context, then each accepted
/// section as a request/answer pair, then the new request. Rejected drafts never
/// enter it.
pub fn clean_history(
    context: &[Message],
    outline: &Outline,
    accepted: &[AcceptedSection],
    index: usize,
) -> Vec<Message> {
    let mut messages = context.to_vec();
    for (done, section) in accepted.iter().enumerate() {
        if let Some(planned) = outline.sections.get(done) {
            messages.push(prompts::section(outline, done, planned));
            messages.push(Message::assistant(section.text.clone()));
        }
    }
    if let Some(planned) = outline.sections.get(index) {
        messages.push(prompts::section(outline, index, planned));
    }
    messages
}

impl Run<'_> {
    pub(super) async fn generate_section(
        &mut self,
        context: &[Message],
        outline: &Outline,
        accepted: &[AcceptedSection],
        index: usize,
    ) -> Result<AcceptedSection, GenerationError> {
        let section: &Section = &outline.sections[index];
        let attempts = self.options.attempts();
        let threshold = self.options.adherence_threshold;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let last = attempt == attempts;
            let messages = clean_history(context, outline, accepted, index);
            let draft = match self
                .call(Stage::Section, messages, SECTION_MAX_OUTPUT_TOKENS)
                .await
            {
                Ok(draft) => draft,
                Err(err) if err.is_cost_exceeded() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(section = index, attempt, error = %format!("{err:#}"), "section draft failed");
                    last_error = Some(err);
                    continue;
                }
            };

            let mut node = draft_section(&draft, &section.title);
            let similarity = title_similarity(&node.content, &section.title);
            if similarity < TITLE_SIMILARITY_THRESHOLD {
                if !last {
                    tracing::info!(
                        section = index,
                        attempt,
                        similarity,
                        heading = %node.content,
                        "section heading off plan; retrying"
                    );
                    continue;
                }
                retitle(&mut node, &section.title);
            }

            let score = match self
                .call(
                    Stage::Adherence,
                    prompts::adherence(section, &draft),
                    ADHERENCE_MAX_OUTPUT_TOKENS,
                )
                .await
            {
                Ok(raw) => parse_adherence_score(&raw).unwrap_or_else(|| {
                    tracing::warn!(section = index, attempt, answer = %raw.trim(), "unparsable adherence score");
                    0
                }),
                Err(err) if err.is_cost_exceeded() => return Err(err.into()),
                Err(err) if last => {
                    tracing::warn!(section = index, attempt, error = %format!("{err:#}"), "adherence check failed");
                    0
                }
                Err(err) => {
                    tracing::warn!(section = index, attempt, error = %format!("{err:#}"), "adherence check failed");
                    last_error = Some(err);
                    continue;
                }
            };

            if score < threshold && !last {
                tracing::info!(section = index, attempt, score, threshold, "section below adherence threshold; retrying");
                continue;
            }

            let forced = score < threshold;
            if forced {
                tracing::warn!(section = index, attempt, score, threshold, "accepting last attempt below threshold");
            } else {
                tracing::info!(section = index, attempt, score, "section accepted");
            }
            let text = markdown::reconstruct(&node);
            return Ok(AcceptedSection {
                title: node.content.clone(),
                node,
                text,
                score,
                attempts: attempt,
                forced,
            });
        }

        Err(GenerationError::SectionFailed {
            index,
            title: section.title.clone(),
            attempts,
            source: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::outline::parse_outline;

    #[test]
    fn similarity_ignores_numbering_case_and_punctuation() {
        assert_eq!(title_similarity("2. Cell Membranes!", "cell membranes"), 100);
        assert_eq!(title_similarity("Section 3: Transport", "Transport"), 100);
        assert!(title_similarity("Membrane transport", "Membrane transports") >= 90);
        assert!(title_similarity("Hallucinated Topic", "Photosynthesis") < TITLE_SIMILARITY_THRESHOLD);
    }

    #[test]
    fn adherence_scores_parse_leniently() {
        assert_eq!(parse_adherence_score("SCORE: 85"), Some(85));
        assert_eq!(parse_adherence_score("Adherence score = 70/100"), Some(70));
        assert_eq!(parse_adherence_score("I'd say 42."), Some(42));
        assert_eq!(parse_adherence_score("SCORE: 640"), None);
        assert_eq!(parse_adherence_score("excellent"), None);
    }

    #[test]
    fn drafts_become_level_two_sections() {
        let node = draft_section("Sure! Here it is.\n\n# Membranes\n\nBilayer.\n\n# Extra\n\nMore.\n", "Membranes");
        assert_eq!(node.level, 2);
        assert_eq!(node.content, "Membranes");
        assert_eq!(
            markdown::reconstruct(&node),
            "## Membranes\n\nBilayer.\n\n### Extra\n\nMore.\n"
        );

        let bare = draft_section("Just text.", "Fallback Title");
        assert_eq!(markdown::reconstruct(&bare), "## Fallback Title\n\nJust text.\n");
    }

    #[test]
    fn history_holds_only_accepted_sections() {
        let outline = parse_outline("# Guide\n\n## One\n\na\n\n## Two\n\nb\n", None);
        let accepted = vec![AcceptedSection {
            title: "One".to_owned(),
            node: Node::section(2, "One"),
            text: "## One\n\nAccepted body.\n".to_owned(),
            score: 90,
            attempts: 2,
            forced: false,
        }];
        let context = vec![Message::system("sys"), Message::user("ctx")];
        let history = clean_history(&context, &outline, &accepted, 1);

        assert_eq!(history.len(), 5);
        assert_eq!(history[3].content, "## One\n\nAccepted body.\n");
        assert!(history[4].content.contains("TASK: SECTION 2 of 2"));
    }
}
