use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod openai;

pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    pub max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            temperature: None,
        }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Concatenated message text, used by tests and logging.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One increment of a provider response. Token counts and cost are usually zero on
/// text deltas and reported once on the final chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatChunk {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub error: Option<String>,
}

impl ChatChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

pub type ChatStream = BoxStream<'static, ChatChunk>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DocumentsMatching,
    Outline,
    TitleCleaning,
    Section,
    Adherence,
    FootnoteMetadata,
    FootnoteProse,
    Flashcards,
    Quiz,
    Abstract,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DocumentsMatching => "documents_matching",
            Self::Outline => "outline",
            Self::TitleCleaning => "title_cleaning",
            Self::Section => "section",
            Self::Adherence => "adherence",
            Self::FootnoteMetadata => "footnote_metadata",
            Self::FootnoteProse => "footnote_prose",
            Self::Flashcards => "flashcards",
            Self::Quiz => "quiz",
            Self::Abstract => "abstract",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 0.40,
            output_per_mtok: 1.60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.calls += other.calls;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error(
        "estimated cost ${estimated:.4} of {stage} call exceeds the per-call limit of ${limit:.4}"
    )]
    CostExceeded {
        stage: Stage,
        estimated: f64,
        limit: f64,
    },
    #[error("{stage} call failed")]
    Provider {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl LlmError {
    pub fn is_cost_exceeded(&self) -> bool {
        matches!(self, Self::CostExceeded { .. })
    }
}

/// Provider front door: gates every call on its estimated cost and folds the
/// response stream into text plus usage.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    pricing: Pricing,
    max_cost_per_call: f64,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, pricing: Pricing, max_cost_per_call: f64) -> Self {
        Self {
            provider,
            pricing,
            max_cost_per_call,
        }
    }

    pub fn pricing(&self) -> Pricing {
        self.pricing
    }

    pub fn max_cost_per_call(&self) -> f64 {
        self.max_cost_per_call
    }

    /// Worst-case cost: prompt tokens at roughly four characters per token plus the
    /// full output budget.
    pub fn estimate_cost(&self, request: &ChatRequest) -> f64 {
        let chars = request
            .messages
            .iter()
            .map(|m| m.content.chars().count() as u64)
            .sum::<u64>();
        let input_tokens = chars.div_ceil(4);
        self.pricing
            .cost(input_tokens, u64::from(request.max_output_tokens))
    }

    pub async fn complete(
        &self,
        stage: Stage,
        request: ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let estimated = self.estimate_cost(&request);
        if estimated > self.max_cost_per_call {
            tracing::warn!(
                %stage,
                model = %request.model,
                estimated,
                limit = self.max_cost_per_call,
                "llm call blocked by cost ceiling"
            );
            return Err(LlmError::CostExceeded {
                stage,
                estimated,
                limit: self.max_cost_per_call,
            });
        }

        tracing::debug!(
            %stage,
            model = %request.model,
            messages = request.messages.len(),
            estimated,
            "llm call"
        );
        let stream = self
            .provider
            .chat(request)
            .await
            .map_err(|source| LlmError::Provider { stage, source })?;
        collect_stream(stream, &self.pricing)
            .await
            .map_err(|source| LlmError::Provider { stage, source })
    }
}

pub async fn collect_stream(
    mut stream: ChatStream,
    pricing: &Pricing,
) -> anyhow::Result<ChatResponse> {
    let mut text = String::new();
    let mut usage = Usage {
        calls: 1,
        ..Usage::default()
    };
    let mut reported_cost = 0.0;

    while let Some(chunk) = stream.next().await {
        if let Some(error) = chunk.error {
            anyhow::bail!("provider stream error: {error}");
        }
        text.push_str(&chunk.text);
        usage.input_tokens += chunk.input_tokens;
        usage.output_tokens += chunk.output_tokens;
        reported_cost += chunk.cost;
    }

    if text.trim().is_empty() {
        anyhow::bail!("model output is empty");
    }
    usage.cost = if reported_cost > 0.0 {
        reported_cost
    } else {
        pricing.cost(usage.input_tokens, usage.output_tokens)
    };
    Ok(ChatResponse { text, usage })
}

/// Extracts the first balanced JSON value (object or array) embedded in model output.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
