//! OpenAI-compatible chat completions backend
//!
//! Streams over SSE and assembles tool-call deltas by index.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use super::{
    aborted, drain_events, BackendErrorKind, EventStream, ModelBackend, ModelEvent, ModelRequest,
    ToolSchema,
};
use crate::budget::{AbortScope, BudgetHandle};
use crate::config::BackendConfig;
use crate::transcript::{AssistantMessage, Message, StopReason, ToolUse, UserContent};
use crate::{Error, Result};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Backend for any OpenAI-compatible `/chat/completions` endpoint
pub struct OpenAiBackend {
    /// API base URL
    api_base: String,
    /// HTTP client with auth headers set
    client: reqwest::Client,
    /// Model name
    model: String,
    max_tokens: u32,
}

/// Chat message format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Serialize)]
struct ToolDefinition {
    #[serde(rename = "type")]
    tool_type: String,
    function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
struct FunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl From<&ToolSchema> for ToolDefinition {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.input_schema.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// Streaming response chunk
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Tool call being assembled from deltas
#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialCall {
    fn finish(self) -> Result<ToolUse> {
        let input = if self.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments).map_err(|e| {
                Error::backend(
                    BackendErrorKind::MalformedContract,
                    format!("tool call {} has invalid arguments: {}", self.name, e),
                )
            })?
        };
        let mut tool_use = ToolUse::new(self.name, input);
        if !self.id.is_empty() {
            tool_use.id = self.id;
        }
        Ok(tool_use)
    }
}

/// Incremental SSE decoder
#[derive(Debug, Default)]
struct SseDecoder {
    /// Bytes of the unfinished line; a chunk may end inside a UTF-8 sequence
    buffer: Vec<u8>,
    calls: BTreeMap<u32, PartialCall>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes, returning the events they complete
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ModelEvent>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            match parse_sse_line(&line) {
                SseLine::Chunk(chunk) => events.extend(self.apply(chunk)?),
                SseLine::Done => {
                    self.done = true;
                    events.extend(self.flush_calls()?);
                }
                SseLine::Skip => {}
            }
        }
        Ok(events)
    }

    /// Flush anything left when the byte stream ends
    fn finish(&mut self) -> Result<Vec<ModelEvent>> {
        let mut events = Vec::new();
        let raw = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&raw);
        if !line.trim().is_empty() {
            if let SseLine::Chunk(chunk) = parse_sse_line(&line) {
                events.extend(self.apply(chunk)?);
            }
        }
        events.extend(self.flush_calls()?);
        Ok(events)
    }

    fn apply(&mut self, chunk: StreamChunk) -> Result<Vec<ModelEvent>> {
        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    events.push(ModelEvent::Text(content));
                }
            }

            if let Some(tool_calls) = choice.delta.tool_calls {
                for tc in tool_calls {
                    let entry = self.calls.entry(tc.index).or_default();
                    if let Some(id) = tc.id {
                        entry.id = id;
                    }
                    if let Some(func) = tc.function {
                        if let Some(name) = func.name {
                            entry.name = name;
                        }
                        if let Some(args) = func.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                events.extend(self.flush_calls()?);
                let reason = match reason.as_str() {
                    "tool_calls" | "function_call" => StopReason::ToolUse,
                    "length" => StopReason::MaxTokens,
                    _ => StopReason::EndTurn,
                };
                events.push(ModelEvent::Stop(reason));
            }
        }
        Ok(events)
    }

    fn flush_calls(&mut self) -> Result<Vec<ModelEvent>> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|call| call.finish().map(ModelEvent::ToolCall))
            .collect()
    }
}

enum SseLine {
    Chunk(StreamChunk),
    Done,
    Skip,
}

/// Parse one SSE line
fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();

    // Skip empty lines and comments
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }

    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str(data) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(e) => {
            debug!("Failed to parse SSE data: {} - {}", e, data);
            SseLine::Skip
        }
    }
}

/// Convert transcript messages to chat messages
fn to_chat_messages(system: &str, messages: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        out.push(ChatMessage::text("system", system.to_string()));
    }

    for message in messages {
        match message {
            Message::Progress(_) => {}
            Message::User(user) => {
                for content in &user.content {
                    match content {
                        UserContent::Text { text } => {
                            out.push(ChatMessage::text("user", text.clone()))
                        }
                        UserContent::ToolResult(block) => out.push(ChatMessage {
                            role: "tool".to_string(),
                            content: Some(block.rendered_content()),
                            tool_calls: None,
                            tool_call_id: Some(block.tool_use_id.clone()),
                        }),
                    }
                }
            }
            Message::Assistant(assistant) => {
                if assistant.is_api_error {
                    continue;
                }
                let text = assistant.joined_text();
                let tool_calls: Vec<ApiToolCall> = assistant
                    .tool_uses
                    .iter()
                    .map(|t| ApiToolCall {
                        id: t.id.clone(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: t.name.clone(),
                            arguments: t.input.to_string(),
                        },
                    })
                    .collect();
                out.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    tool_call_id: None,
                });
            }
        }
    }
    out
}

impl OpenAiBackend {
    /// Create a backend for `model` using the connection settings in `config`
    pub fn new(config: &BackendConfig, model: &str) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(&config.api_key_env).ok())
            .ok_or_else(|| {
                Error::Config(format!(
                    "API key not configured (set backend.api_key or ${})",
                    config.api_key_env
                ))
            })?;

        // Build HTTP client with default headers
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| Error::Config(format!("Invalid API key format: {}", e)))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
            model: model.to_string(),
            max_tokens: config.max_tokens,
        })
    }

    async fn open_stream(&self, request: &ModelRequest) -> Result<reqwest::Response> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: to_chat_messages(&request.system, &request.messages),
            tools: request.tools.iter().map(ToolDefinition::from).collect(),
            stream: true,
            max_tokens: Some(request.max_tokens.unwrap_or(self.max_tokens)),
        };

        let url = format!("{}/chat/completions", self.api_base);
        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                BackendErrorKind::Timeout
            } else {
                BackendErrorKind::Transport
            };
            Error::backend(kind, format!("request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let kind = BackendErrorKind::from_status(status.as_u16(), &text);
            warn!("Backend returned {}: {}", status, text);
            return Err(Error::backend(kind, format!("HTTP {}: {}", status, text)));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        request: &ModelRequest,
        abort: &AbortScope,
    ) -> Result<AssistantMessage> {
        let events = self.stream(request, abort).await?;
        let mut message = drain_events(events, &BudgetHandle::unlimited()).await?;
        message.stop.model = Some(self.model.clone());
        Ok(message)
    }

    async fn stream(&self, request: &ModelRequest, abort: &AbortScope) -> Result<EventStream> {
        let response = tokio::select! {
            response = self.open_stream(request) => response?,
            _ = abort.cancelled() => return Err(aborted(abort)),
        };

        struct State {
            bytes: stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
            decoder: SseDecoder,
            pending: VecDeque<ModelEvent>,
            abort: AbortScope,
            finished: bool,
        }

        let state = State {
            bytes: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            abort: abort.clone(),
            finished: false,
        };

        let events = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.finished {
                    return None;
                }

                let next = tokio::select! {
                    next = state.bytes.next() => next,
                    _ = state.abort.cancelled() => {
                        state.finished = true;
                        return Some((Err(aborted(&state.abort)), state));
                    }
                };

                let decoded = match next {
                    Some(Ok(bytes)) => state.decoder.feed(&bytes),
                    Some(Err(e)) => {
                        state.finished = true;
                        Err(Error::backend(
                            BackendErrorKind::Transport,
                            format!("stream error: {}", e),
                        ))
                    }
                    None => {
                        state.finished = true;
                        state.decoder.finish()
                    }
                };

                match decoded {
                    Ok(events) => {
                        state.pending.extend(events);
                        if state.decoder.done {
                            state.finished = true;
                        }
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}
