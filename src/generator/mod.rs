//! Tool generator: turns a lecture transcript plus its reference pages into a
//! vetted, citation-annotated study document.
//!
//! The pipeline runs strictly in order: documents matching, outline, sections one by
//! one, then footnote healing. Every model call goes through [`LlmClient`], so the
//! per-call cost ceiling applies to all of them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::{ChatRequest, LlmClient, LlmError, Message, Stage, Usage};
use crate::markdown::{self, Node, NodeKind, ParsedCitation};
use crate::progress::Progress;

pub mod footnotes;
pub mod matching;
pub mod outline;
pub mod prompts;
pub mod sections;

pub use matching::{PageRange, ReferencePage, build_material_tree, merge_ranges};
pub use outline::{MaterialLength, Outline, Section, SectionPolicy};
pub use sections::{AcceptedSection, TITLE_SIMILARITY_THRESHOLD, title_similarity};

pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

const OUTLINE_MAX_OUTPUT_TOKENS: u32 = 2048;
const TITLE_MAX_OUTPUT_TOKENS: u32 = 128;
const SINGLE_SHOT_MAX_OUTPUT_TOKENS: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    Guide,
    Flashcards,
    Quiz,
}

impl MaterialKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guide => "guide",
            Self::Flashcards => "flashcards",
            Self::Quiz => "quiz",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Guide => "study guide",
            Self::Flashcards => "flashcard deck",
            Self::Quiz => "quiz",
        }
    }

    fn default_title(self) -> &'static str {
        match self {
            Self::Guide => "Study Guide",
            Self::Flashcards => "Flashcards",
            Self::Quiz => "Quiz",
        }
    }
}

impl fmt::Display for MaterialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaterialKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guide" => Ok(Self::Guide),
            "flashcards" => Ok(Self::Flashcards),
            "quiz" => Ok(Self::Quiz),
            other => anyhow::bail!("unknown material kind: {other}"),
        }
    }
}

/// Model per pipeline stage, falling back to `default`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageModels {
    pub default: String,
    pub overrides: BTreeMap<Stage, String>,
}

impl Default for StageModels {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

impl StageModels {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with(mut self, stage: Stage, model: impl Into<String>) -> Self {
        self.overrides.insert(stage, model.into());
        self
    }

    pub fn model(&self, stage: Stage) -> &str {
        self.overrides
            .get(&stage)
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

/// Per-invocation overrides. Immutable for the duration of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub documents_matching: bool,
    pub adherence_threshold: u8,
    pub maximum_retries: u32,
    pub models: StageModels,
    /// Derived from the transcript when unset.
    pub length: Option<MaterialLength>,
    pub language: String,
    pub ensemble_runs: usize,
    pub ensemble_concurrency: usize,
    /// Outline retries wait this long times the attempt number.
    pub retry_backoff_ms: u64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            documents_matching: true,
            adherence_threshold: 70,
            maximum_retries: 3,
            models: StageModels::default(),
            length: None,
            language: "English".to_owned(),
            ensemble_runs: 3,
            ensemble_concurrency: 3,
            retry_backoff_ms: 1_000,
        }
    }
}

impl GenerationOptions {
    pub fn attempts(&self) -> u32 {
        self.maximum_retries.max(1)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("transcript is empty")]
    EmptyTranscript,
    #[error("all {runs} documents-matching runs failed")]
    MatchingFailed {
        runs: usize,
        #[source]
        source: LlmError,
    },
    #[error(
        "no valid outline after {attempts} attempts (expected {minimum} to {maximum} sections, last answer had {found})"
    )]
    InvalidOutline {
        attempts: u32,
        minimum: usize,
        maximum: usize,
        found: usize,
        #[source]
        source: Option<LlmError>,
    },
    #[error("section {} ({:?}) was not accepted after {} attempts", .index + 1, .title, .attempts)]
    SectionFailed {
        index: usize,
        title: String,
        attempts: u32,
        #[source]
        source: Option<LlmError>,
    },
}

impl GenerationError {
    pub fn is_cost_exceeded(&self) -> bool {
        matches!(self, Self::Llm(err) if err.is_cost_exceeded())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationInput<'a> {
    pub kind: MaterialKind,
    pub title: Option<&'a str>,
    pub transcript: &'a str,
    pub pages: &'a [ReferencePage],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionReport {
    pub title: String,
    pub score: u8,
    pub attempts: u32,
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedMaterial {
    pub kind: MaterialKind,
    pub title: String,
    /// Final markdown: title, sections and footnote definitions.
    pub content: String,
    pub citations: Vec<ParsedCitation>,
    pub sections: Vec<SectionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_ranges: Option<Vec<PageRange>>,
    pub usage: BTreeMap<Stage, Usage>,
}

impl GeneratedMaterial {
    pub fn total_usage(&self) -> Usage {
        let mut total = Usage::default();
        for usage in self.usage.values() {
            total.add(usage);
        }
        total
    }
}

#[derive(Clone)]
pub struct ToolGenerator {
    llm: LlmClient,
}

impl ToolGenerator {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    pub async fn generate(
        &self,
        input: GenerationInput<'_>,
        options: &GenerationOptions,
        progress: &dyn Progress,
    ) -> Result<GeneratedMaterial, GenerationError> {
        if input.transcript.trim().is_empty() {
            return Err(GenerationError::EmptyTranscript);
        }
        tracing::info!(
            kind = %input.kind,
            pages = input.pages.len(),
            documents_matching = options.documents_matching,
            "generation started"
        );

        let mut run = Run {
            llm: &self.llm,
            options,
            usage: BTreeMap::new(),
        };

        let full_material = build_material_tree(input.pages);
        let sources = matching::source_listing(&full_material);
        let mut matched_ranges = None;
        let material = if options.documents_matching && !full_material.children.is_empty() {
            progress.report(5, "matching reference pages").await;
            match matching::match_documents(
                &self.llm,
                options.models.model(Stage::DocumentsMatching),
                input.transcript,
                &markdown::reconstruct(&full_material),
                options.ensemble_runs,
                options.ensemble_concurrency,
            )
            .await
            {
                Ok((ranges, usage)) => {
                    run.record(Stage::DocumentsMatching, &usage);
                    let filtered = matching::filter_material(&full_material, &ranges);
                    if filtered.children.is_empty() {
                        tracing::warn!("documents matching selected no pages; using all material");
                        full_material
                    } else {
                        matched_ranges = Some(ranges);
                        filtered
                    }
                }
                Err(err) if err.is_cost_exceeded() => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "documents matching failed; using all material");
                    full_material
                }
            }
        } else {
            full_material
        };

        let context = vec![
            prompts::system(options),
            prompts::shared_context(input.transcript, &markdown::reconstruct(&material)),
        ];

        let (title, body, reports) = match input.kind {
            MaterialKind::Guide => run.guide(&context, input, progress).await?,
            MaterialKind::Flashcards | MaterialKind::Quiz => {
                progress.report(20, "writing material").await;
                run.single_shot(&context, input).await?
            }
        };

        let mut root = Node::section(1, title.clone());
        root.children.extend(body);
        let (text, mut citations) =
            markdown::parse_citations(&markdown::reconstruct(&Node::document(vec![root])));

        if !citations.is_empty() {
            progress.report(88, "healing footnotes").await;
            run.heal_footnotes(&mut citations, &sources).await?;
        }
        let mut tree = markdown::parse(&text);
        markdown::bind_citations(&mut tree, &citations);
        let content = markdown::reconstruct(&tree);

        let material = GeneratedMaterial {
            kind: input.kind,
            title,
            content,
            citations,
            sections: reports,
            matched_ranges,
            usage: run.usage,
        };
        let total = material.total_usage();
        tracing::info!(
            kind = %material.kind,
            sections = material.sections.len(),
            citations = material.citations.len(),
            calls = total.calls,
            cost = total.cost,
            "generation finished"
        );
        progress.report(95, "generation finished").await;
        Ok(material)
    }
}

/// State of one generation call: the options it runs under and its usage ledger.
pub(crate) struct Run<'a> {
    llm: &'a LlmClient,
    options: &'a GenerationOptions,
    usage: BTreeMap<Stage, Usage>,
}

type Assembled = (String, Vec<Node>, Vec<SectionReport>);

impl Run<'_> {
    fn record(&mut self, stage: Stage, usage: &Usage) {
        self.usage.entry(stage).or_default().add(usage);
    }

    async fn call(
        &mut self,
        stage: Stage,
        messages: Vec<Message>,
        max_output_tokens: u32,
    ) -> Result<String, LlmError> {
        let request = ChatRequest::new(self.options.models.model(stage), messages)
            .with_max_output_tokens(max_output_tokens);
        let response = self.llm.complete(stage, request).await?;
        self.record(stage, &response.usage);
        Ok(response.text)
    }

    async fn guide(
        &mut self,
        context: &[Message],
        input: GenerationInput<'_>,
        progress: &dyn Progress,
    ) -> Result<Assembled, GenerationError> {
        let length = self
            .options
            .length
            .unwrap_or_else(|| MaterialLength::from_transcript(input.transcript));
        let policy = length.policy();

        progress.report(15, "planning outline").await;
        let mut outline = self.outline(context, input, policy).await?;
        self.clean_title(&mut outline).await?;

        let total = outline.sections.len();
        let mut accepted: Vec<AcceptedSection> = Vec::with_capacity(total);
        for index in 0..total {
            let percent = 20 + (65 * index / total.max(1)) as u8;
            progress
                .report(
                    percent,
                    &format!("writing section {} of {total}: {}", index + 1, outline.sections[index].title),
                )
                .await;
            let section = self
                .generate_section(context, &outline, &accepted, index)
                .await?;
            accepted.push(section);
        }

        let reports = accepted
            .iter()
            .map(|s| SectionReport {
                title: s.title.clone(),
                score: s.score,
                attempts: s.attempts,
                forced: s.forced,
            })
            .collect();
        let body = accepted.into_iter().map(|s| s.node).collect();
        Ok((outline.title, body, reports))
    }

    async fn outline(
        &mut self,
        context: &[Message],
        input: GenerationInput<'_>,
        policy: SectionPolicy,
    ) -> Result<Outline, GenerationError> {
        let attempts = self.options.attempts();
        let mut found = 0usize;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let mut messages = context.to_vec();
            messages.push(prompts::outline(input.kind, policy, input.title));
            match self
                .call(Stage::Outline, messages, OUTLINE_MAX_OUTPUT_TOKENS)
                .await
            {
                Ok(text) => {
                    let outline = outline::parse_outline(&text, input.title);
                    if policy.accepts(outline.sections.len()) {
                        tracing::info!(attempt, sections = outline.sections.len(), "outline accepted");
                        return Ok(outline);
                    }
                    found = outline.sections.len();
                    tracing::warn!(
                        attempt,
                        found,
                        minimum = policy.minimum,
                        maximum = policy.maximum,
                        "outline section count out of bounds"
                    );
                }
                Err(err) if err.is_cost_exceeded() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(attempt, error = %format!("{err:#}"), "outline call failed");
                    last_error = Some(err);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.backoff(attempt)).await;
            }
        }

        Err(GenerationError::InvalidOutline {
            attempts,
            minimum: policy.minimum,
            maximum: policy.maximum,
            found,
            source: last_error,
        })
    }

    async fn clean_title(&mut self, outline: &mut Outline) -> Result<(), GenerationError> {
        let fallback = outline::strip_template_artifacts(&outline.title);
        let cleaned = match self
            .call(
                Stage::TitleCleaning,
                prompts::title_cleaning(&outline.title),
                TITLE_MAX_OUTPUT_TOKENS,
            )
            .await
        {
            Ok(answer) => outline::cleaned_title(&answer, &fallback),
            Err(err) if err.is_cost_exceeded() => return Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "title cleaning failed; stripping locally");
                fallback
            }
        };
        if !cleaned.is_empty() && cleaned != outline.title {
            tracing::debug!(from = %outline.title, to = %cleaned, "title cleaned");
            outline.retitle(&cleaned);
        }
        Ok(())
    }

    /// Flashcards and quizzes: one call for the whole document.
    async fn single_shot(
        &mut self,
        context: &[Message],
        input: GenerationInput<'_>,
    ) -> Result<Assembled, GenerationError> {
        let stage = match input.kind {
            MaterialKind::Quiz => Stage::Quiz,
            _ => Stage::Flashcards,
        };
        let attempts = self.options.attempts();
        let mut messages = context.to_vec();
        messages.push(prompts::single_shot(input.kind, input.title));

        let mut attempt = 1;
        let text = loop {
            match self
                .call(stage, messages.clone(), SINGLE_SHOT_MAX_OUTPUT_TOKENS)
                .await
            {
                Ok(text) => break text,
                Err(err) if err.is_cost_exceeded() || attempt >= attempts => {
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::warn!(%stage, attempt, error = %format!("{err:#}"), "generation call failed; retrying");
                    tokio::time::sleep(self.options.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        };

        let mut tree = markdown::parse(&text);
        let single_root = tree.children.len() == 1
            && tree.children[0].kind == NodeKind::Section
            && tree.children[0].level == 1;
        let fallback_title = input.title.unwrap_or(input.kind.default_title());
        let (title, body) = if single_root {
            let root = tree.children.remove(0);
            let title = outline::strip_template_artifacts(&root.content);
            let body = root
                .children
                .into_iter()
                .filter(|child| child.kind != NodeKind::Heading)
                .collect::<Vec<_>>();
            (title, body)
        } else {
            let body = tree
                .children
                .into_iter()
                .map(|mut child| {
                    if child.kind == NodeKind::Section && child.level < 2 {
                        child.relevel(2);
                    }
                    child
                })
                .collect();
            (String::new(), body)
        };
        let title = if title.is_empty() {
            fallback_title.to_owned()
        } else {
            title
        };
        Ok((title, body, Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use futures::StreamExt as _;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::{ChatChunk, ChatStream, LlmProvider, Pricing};
    use crate::progress::NoProgress;

    /// Answers each stage from its own script, keyed by the stage's model name.
    struct Scripted {
        answers: Mutex<BTreeMap<String, VecDeque<String>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl Scripted {
        fn new(script: &[(&str, &[&str])]) -> Arc<Self> {
            let answers = script
                .iter()
                .map(|(model, answers)| {
                    (
                        (*model).to_owned(),
                        answers.iter().map(|a| (*a).to_owned()).collect(),
                    )
                })
                .collect();
            Arc::new(Self {
                answers: Mutex::new(answers),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests_for(&self, model: &str) -> Vec<ChatRequest> {
            self.requests
                .lock()
                .expect("lock")
                .iter()
                .filter(|r| r.model == model)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatStream> {
            let answer = self
                .answers
                .lock()
                .expect("lock")
                .get_mut(&request.model)
                .and_then(VecDeque::pop_front);
            self.requests.lock().expect("lock").push(request);
            let answer = answer.ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
            Ok(futures::stream::iter(vec![ChatChunk::text(answer)]).boxed())
        }
    }

    fn options() -> GenerationOptions {
        GenerationOptions {
            documents_matching: false,
            retry_backoff_ms: 0,
            length: Some(MaterialLength::Short),
            models: StageModels::new("default")
                .with(Stage::Outline, "outline")
                .with(Stage::TitleCleaning, "title")
                .with(Stage::Section, "section")
                .with(Stage::Adherence, "adherence")
                .with(Stage::FootnoteMetadata, "meta")
                .with(Stage::FootnoteProse, "prose")
                .with(Stage::Quiz, "quiz"),
            ..GenerationOptions::default()
        }
    }

    fn generator(provider: Arc<Scripted>) -> ToolGenerator {
        ToolGenerator::new(LlmClient::new(provider, Pricing::default(), 10.0))
    }

    fn input(kind: MaterialKind) -> GenerationInput<'static> {
        GenerationInput {
            kind,
            title: None,
            transcript: "Today we cover membranes.",
            pages: &[],
        }
    }

    #[tokio::test]
    async fn outline_retries_until_section_count_fits() -> anyhow::Result<()> {
        let provider = Scripted::new(&[
            ("outline", &["# T\n\n## A\n\n## B\n\n## C\n\n## D\n\n## E\n", "# T\n\n## A\n\na\n"]),
            ("title", &["T"]),
            ("section", &["## A\n\nBody."]),
            ("adherence", &["SCORE: 90"]),
        ]);
        let material = generator(provider.clone())
            .generate(input(MaterialKind::Guide), &options(), &NoProgress)
            .await?;
        assert_eq!(material.content, "# T\n\n## A\n\nBody.\n");
        assert_eq!(provider.requests_for("outline").len(), 2);
        assert_eq!(material.usage[&Stage::Outline].calls, 2);
        Ok(())
    }

    #[tokio::test]
    async fn outline_failure_is_terminal() {
        let too_many = "# T\n\n## A\n\n## B\n\n## C\n\n## D\n\n## E\n";
        let provider = Scripted::new(&[("outline", &[too_many, too_many, too_many])]);
        let err = generator(provider)
            .generate(input(MaterialKind::Guide), &options(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::InvalidOutline { found: 5, attempts: 3, .. }));
    }

    #[tokio::test]
    async fn off_plan_heading_skips_adherence_check() -> anyhow::Result<()> {
        let provider = Scripted::new(&[
            ("outline", &["# T\n\n## Membranes\n\nlipids\n"]),
            ("title", &["T"]),
            ("section", &["## Volcanoes\n\nLava.", "## Membranes\n\nLipids."]),
            ("adherence", &["SCORE: 80"]),
        ]);
        let material = generator(provider.clone())
            .generate(input(MaterialKind::Guide), &options(), &NoProgress)
            .await?;
        assert_eq!(provider.requests_for("adherence").len(), 1);
        assert_eq!(material.sections[0].attempts, 2);
        assert!(!material.content.contains("Lava"));
        Ok(())
    }

    #[tokio::test]
    async fn quiz_is_a_single_call_with_healed_footnotes() -> anyhow::Result<()> {
        let provider = Scripted::new(&[
            (
                "quiz",
                &["# Quiz: Cells\n\n## Questions\n\n1. What bounds a cell? {{cite: membranes bound cells (bio.pdf p. 2); file: bio.pdf; pages: 2}}\n"],
            ),
            ("meta", &["[{\"number\": 1, \"pages\": [2, 3]}]"]),
            ("prose", &["[{\"number\": 1, \"description\": \"Membranes bound every cell.\"}]"]),
        ]);
        let material = generator(provider)
            .generate(input(MaterialKind::Quiz), &options(), &NoProgress)
            .await?;
        assert_eq!(material.title, "Quiz: Cells");
        assert!(material.content.contains("1. What bounds a cell?[^1]"));
        assert!(material.content.contains(
            "[^1]: Membranes bound every cell. <!-- source: bio.pdf; pages: 2, 3 -->"
        ));
        Ok(())
    }

    #[test]
    fn options_deserialize_with_defaults() -> anyhow::Result<()> {
        let options: GenerationOptions = serde_json::from_str(
            r#"{"adherence_threshold": 80, "models": {"overrides": {"outline": "big"}}}"#,
        )?;
        assert_eq!(options.adherence_threshold, 80);
        assert!(options.documents_matching);
        assert_eq!(options.models.model(Stage::Outline), "big");
        assert_eq!(options.models.model(Stage::Section), DEFAULT_MODEL);
        Ok(())
    }
}
