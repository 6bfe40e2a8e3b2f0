use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream::BoxStream;

use crate::llm::{ChatChunk, ChatRequest, ChatStream, LlmProvider, Pricing, Role};

pub fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

/// OpenAI Responses API provider.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    pricing: Pricing,
}

impl OpenAiProvider {
    pub fn new(base_url: &str, api_key: impl Into<String>, pricing: Pricing) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: responses_endpoint(base_url),
            api_key: api_key.into(),
            pricing,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatStream> {
        let body = request_body(&request);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = parse_error_message(&raw).unwrap_or(raw);
            anyhow::bail!("OpenAI API error ({status}): {message}");
        }

        if request.stream {
            return Ok(event_stream(response.bytes_stream().boxed(), self.pricing));
        }

        let raw = response.text().await.context("read OpenAI response body")?;
        let value: serde_json::Value = serde_json::from_str(&raw).context("parse OpenAI response")?;
        let text = extract_output_text(&value).context("extract output text")?;
        let chunk = usage_chunk(value.get("usage"), self.pricing, text);
        Ok(futures::stream::once(async move { chunk }).boxed())
    }
}

fn request_body(request: &ChatRequest) -> serde_json::Value {
    let instructions = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let input = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
            })
        })
        .collect::<Vec<_>>();

    let mut body = serde_json::json!({
        "model": request.model,
        "input": input,
        "text": { "format": { "type": "text" } },
        "max_output_tokens": request.max_output_tokens,
        "stream": request.stream,
        "store": false,
    });

    if let Some(obj) = body.as_object_mut() {
        if !instructions.is_empty() {
            obj.insert("instructions".to_owned(), serde_json::json!(instructions));
        }
        // NOTE: GPT-5 models reject sampling params like `temperature`.
        if let Some(temperature) = request.temperature
            && !request.model.starts_with("gpt-5")
        {
            obj.insert("temperature".to_owned(), serde_json::json!(temperature));
        }
    }
    body
}

fn usage_chunk(usage: Option<&serde_json::Value>, pricing: Pricing, text: String) -> ChatChunk {
    let tokens = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    let input_tokens = tokens("input_tokens");
    let output_tokens = tokens("output_tokens");
    ChatChunk {
        text,
        input_tokens,
        output_tokens,
        cost: pricing.cost(input_tokens, output_tokens),
        error: None,
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

fn extract_output_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let mut text = String::new();
    for item in output {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        let Some(content) = item.get("content").and_then(|v| v.as_array()) else {
            continue;
        };
        for part in content {
            if part.get("type").and_then(|v| v.as_str()) != Some("output_text") {
                continue;
            }
            if let Some(part_text) = part.get("text").and_then(|v| v.as_str()) {
                text.push_str(part_text);
            }
        }
    }

    if text.trim().is_empty() {
        anyhow::bail!("OpenAI output text is empty");
    }
    Ok(text)
}

struct EventState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    finished: bool,
}

/// Turns a server-sent event body into chunks: text deltas as they arrive, then one
/// usage chunk from `response.completed`.
fn event_stream(
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    pricing: Pricing,
) -> ChatStream {
    let state = EventState {
        bytes,
        buffer: Vec::new(),
        finished: false,
    };
    futures::stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(chunk) = next_event(&mut state.buffer, pricing) {
                return Some((chunk, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    state.finished = true;
                    state.buffer.clear();
                    return Some((ChatChunk::failed(format!("read event stream: {err}")), state));
                }
                None => {
                    state.finished = true;
                    state.buffer.push(b'\n');
                }
            }
        }
    })
    .boxed()
}

fn next_event(buffer: &mut Vec<u8>, pricing: Pricing) -> Option<ChatChunk> {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line = buffer.drain(..=pos).collect::<Vec<_>>();
        let line = String::from_utf8_lossy(&line);
        let Some(data) = line.trim_end().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        match event.get("type").and_then(|v| v.as_str()) {
            Some("response.output_text.delta") => {
                let delta = event.get("delta").and_then(|v| v.as_str()).unwrap_or("");
                return Some(ChatChunk::text(delta));
            }
            Some("response.completed") => {
                let usage = event.pointer("/response/usage");
                return Some(usage_chunk(usage, pricing, String::new()));
            }
            Some("error") | Some("response.failed") => {
                let message = event
                    .pointer("/error/message")
                    .or_else(|| event.pointer("/response/error/message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error");
                return Some(ChatChunk::failed(message));
            }
            _ => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    #[test]
    fn system_messages_become_instructions() {
        let request = ChatRequest::new(
            "gpt-4.1-mini",
            vec![
                Message::system("be terse"),
                Message::user("hi"),
                Message::assistant("hello"),
            ],
        )
        .with_temperature(0.2);
        let body = request_body(&request);
        assert_eq!(body["instructions"], "be terse");
        assert_eq!(body["input"].as_array().map(Vec::len), Some(2));
        assert_eq!(body["input"][1]["role"], "assistant");
        assert!(body.get("temperature").is_some());
    }

    #[test]
    fn gpt5_requests_omit_temperature() {
        let request =
            ChatRequest::new("gpt-5-mini", vec![Message::user("hi")]).with_temperature(0.2);
        assert!(request_body(&request).get("temperature").is_none());
    }

    #[test]
    fn events_yield_deltas_then_usage() {
        let pricing = Pricing::default();
        let mut buffer = b"event: response.output_text.delta\n\
data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hel\"}\n\n\
data: {\"type\":\"response.output_text.delta\",\"delta\":\"lo\"}\n\n\
data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":3}}}\n\n"
            .to_vec();

        assert_eq!(next_event(&mut buffer, pricing).map(|c| c.text), Some("Hel".to_owned()));
        assert_eq!(next_event(&mut buffer, pricing).map(|c| c.text), Some("lo".to_owned()));
        let usage = next_event(&mut buffer, pricing).expect("usage chunk");
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 3);
        assert!(next_event(&mut buffer, pricing).is_none());
    }
}
