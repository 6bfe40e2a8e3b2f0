use crate::generator::outline::{Outline, Section, SectionPolicy};
use crate::generator::{GenerationOptions, MaterialKind};
use crate::llm::Message;
use crate::markdown::ParsedCitation;
use crate::markdown::format_page_list;

use super::matching::SourceListing;

pub fn system(options: &GenerationOptions) -> Message {
    Message::system(format!(
        "You are an experienced university teaching assistant who writes study material \
from lecture transcripts and the reference documents handed out with the lecture.\n\
\n\
Write in {language}. Use Markdown. Stay faithful to the transcript and the reference \
material; never invent facts that neither of them supports.",
        language = options.language,
    ))
}

/// First user turn shared by every stage that needs the full lecture context.
pub fn shared_context(transcript: &str, material: &str) -> Message {
    let material = if material.trim().is_empty() {
        "(no reference material)"
    } else {
        material.trim_end()
    };
    Message::user(format!(
        "Lecture context for the whole conversation.\n\
\n\
BEGIN_TRANSCRIPT\n\
{transcript}\n\
END_TRANSCRIPT\n\
\n\
Reference material. Files are headed `# File: <name>` and pages `## Page <n>`.\n\
\n\
BEGIN_MATERIAL\n\
{material}\n\
END_MATERIAL\n",
        transcript = transcript.trim_end(),
    ))
}

pub fn documents_matching(transcript: &str, material: &str) -> Vec<Message> {
    vec![
        Message::system(
            "You select which pages of the reference material a lecture actually covers.",
        ),
        Message::user(format!(
            "TASK: DOCUMENTS_MATCHING\n\
\n\
BEGIN_TRANSCRIPT\n\
{transcript}\n\
END_TRANSCRIPT\n\
\n\
BEGIN_MATERIAL\n\
{material}\n\
END_MATERIAL\n\
\n\
You MUST:\n\
- Return the page ranges of the material that the transcript discusses.\n\
- Use the page numbers from the `## Page <n>` headings.\n\
- Return an empty list when nothing matches.\n\
\n\
Output:\n\
- Output ONLY a single JSON object (no markdown fences, no commentary).\n\
- Schema: {{\"ranges\":[{{\"start\":1,\"end\":3}}]}}\n",
            transcript = transcript.trim_end(),
            material = material.trim_end(),
        )),
    ]
}

pub fn outline(kind: MaterialKind, policy: SectionPolicy, title_hint: Option<&str>) -> Message {
    let title_hint = title_hint
        .map(|t| format!("- Suggested title: {t}\n"))
        .unwrap_or_default();
    Message::user(format!(
        "TASK: OUTLINE\n\
\n\
Plan a {kind} for this lecture.\n\
\n\
You MUST:\n\
- Start with a single `# <title>` line naming the {kind}.\n\
- Follow with between {minimum} and {maximum} sections, ideally {preferred}.\n\
- Head each section `## <section title>` and describe below it, in a short paragraph, \
what the section must cover.\n\
{title_hint}\
\n\
Output ONLY the outline.\n",
        kind = kind.label(),
        minimum = policy.minimum,
        maximum = policy.maximum,
        preferred = policy.preferred,
    ))
}

pub fn title_cleaning(raw_title: &str) -> Vec<Message> {
    vec![
        Message::system("You fix document titles."),
        Message::user(format!(
            "TASK: TITLE_CLEANING\n\
\n\
The title below was produced from a planning template and may still carry template \
wording such as \"Structural Schema for:\", \"Outline:\" or surrounding quotes.\n\
\n\
BEGIN_TITLE\n\
{raw_title}\n\
END_TITLE\n\
\n\
Output ONLY the cleaned title on a single line.\n"
        )),
    ]
}

/// Request for one section. The outline is repeated so each request stands on its own
/// in the clean history.
pub fn section(outline: &Outline, index: usize, section: &Section) -> Message {
    Message::user(format!(
        "TASK: SECTION {number} of {total}\n\
\n\
Document: {title}\n\
\n\
BEGIN_OUTLINE\n\
{outline}\n\
END_OUTLINE\n\
\n\
Write the section `## {section_title}`.\n\
It must cover:\n\
{coverage}\n\
\n\
You MUST:\n\
- Start with the heading `## {section_title}`.\n\
- Use `###` or deeper for sub-headings.\n\
- Cite the reference material inline as \
`{{{{cite: <what the source says>; file: <file name>; pages: <pages>}}}}` right after \
the claim it supports.\n\
- Not repeat earlier sections.\n",
        number = index + 1,
        total = outline.sections.len(),
        title = outline.title,
        outline = outline.text.trim_end(),
        section_title = section.title,
        coverage = section.coverage,
    ))
}

pub fn adherence(section: &Section, draft: &str) -> Vec<Message> {
    vec![
        Message::system("You grade study-guide sections against their brief."),
        Message::user(format!(
            "TASK: ADHERENCE\n\
\n\
Expected title: {title}\n\
Expected coverage:\n\
{coverage}\n\
\n\
BEGIN_DRAFT\n\
{draft}\n\
END_DRAFT\n\
\n\
Score from 0 to 100 how completely and accurately the draft covers the expected \
coverage, staying on topic.\n\
\n\
Output ONLY `SCORE: <n>`.\n",
            title = section.title,
            coverage = section.coverage,
            draft = draft.trim_end(),
        )),
    ]
}

pub fn single_shot(kind: MaterialKind, title_hint: Option<&str>) -> Message {
    let shape = match kind {
        MaterialKind::Flashcards => {
            "- Under `## Flashcards`, write one `### <question>` per card followed by the \
answer.\n"
        }
        MaterialKind::Quiz => {
            "- Under `## Questions`, write numbered multiple-choice questions with options \
`a)` to `d)`.\n\
- Under `## Answers`, give the correct option for each question with a one-line \
explanation.\n"
        }
        MaterialKind::Guide => "- Organise the guide under `##` section headings.\n",
    };
    let title_hint = title_hint
        .map(|t| format!("- Suggested title: {t}\n"))
        .unwrap_or_default();
    Message::user(format!(
        "TASK: {task}\n\
\n\
Write a {kind} for this lecture.\n\
\n\
You MUST:\n\
- Start with a single `# <title>` line.\n\
{shape}\
- Cite the reference material inline as \
`{{{{cite: <what the source says>; file: <file name>; pages: <pages>}}}}`.\n\
{title_hint}",
        task = kind.label().to_ascii_uppercase(),
        kind = kind.label(),
    ))
}

pub fn footnote_metadata(batch: &[ParsedCitation], sources: &[SourceListing]) -> Vec<Message> {
    let listing = sources
        .iter()
        .map(|s| format!("- {}: pages {}", s.file, format_page_list(&s.pages)))
        .collect::<Vec<_>>()
        .join("\n");
    let records = batch
        .iter()
        .map(|c| {
            serde_json::json!({
                "number": c.number,
                "description": c.description,
                "file": c.file,
                "pages": c.pages,
            })
        })
        .collect::<Vec<_>>();
    let records = serde_json::to_string_pretty(&records).unwrap_or_else(|_| "[]".to_owned());

    vec![
        Message::system("You verify citation sources against a list of reference files."),
        Message::user(format!(
            "TASK: FOOTNOTE_METADATA\n\
\n\
Available sources:\n\
{listing}\n\
\n\
BEGIN_CITATIONS_JSON\n\
{records}\n\
END_CITATIONS_JSON\n\
\n\
For every citation, return the file and pages it most likely refers to. Use only the \
available file names.\n\
\n\
Output:\n\
- Output ONLY a JSON array (no markdown fences, no commentary).\n\
- Schema: [{{\"number\":1,\"file\":\"name.pdf\",\"pages\":[3,4]}}]\n"
        )),
    ]
}

pub fn footnote_prose(batch: &[ParsedCitation]) -> Vec<Message> {
    let records = batch
        .iter()
        .map(|c| serde_json::json!({ "number": c.number, "description": c.description }))
        .collect::<Vec<_>>();
    let records = serde_json::to_string_pretty(&records).unwrap_or_else(|_| "[]".to_owned());

    vec![
        Message::system("You copy-edit footnotes."),
        Message::user(format!(
            "TASK: FOOTNOTE_PROSE\n\
\n\
BEGIN_CITATIONS_JSON\n\
{records}\n\
END_CITATIONS_JSON\n\
\n\
Rewrite each description as one clean sentence stating what the source says.\n\
Never mention file names, page numbers or the word \"page\".\n\
\n\
Output:\n\
- Output ONLY a JSON array (no markdown fences, no commentary).\n\
- Schema: [{{\"number\":1,\"description\":\"...\"}}]\n"
        )),
    ]
}

pub fn abstract_(title: &str, content: &str) -> Vec<Message> {
    vec![
        Message::system("You write short abstracts for study material."),
        Message::user(format!(
            "TASK: ABSTRACT\n\
\n\
BEGIN_DOCUMENT\n\
# {title}\n\
\n\
{content}\n\
END_DOCUMENT\n\
\n\
Write a two or three sentence abstract of the document. Output ONLY the abstract.\n",
            content = content.trim_end(),
        )),
    ]
}
