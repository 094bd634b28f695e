//! Model backend abstraction
//!
//! A backend turns a transcript, a system prompt and tool schemas into one
//! assistant message. Backends stream incremental events; the retry harness
//! folds them with [`drain_events`] so every event is charged to the
//! attempt's budget.

mod openai;
#[cfg(any(test, feature = "test-support"))]
mod scripted;

pub use openai::OpenAiBackend;
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{ScriptStep, ScriptedBackend};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::budget::{AbortScope, BudgetHandle};
use crate::config::{BackendConfig, BackendKind};
use crate::transcript::{AssistantMessage, Message, StopReason, ToolUse};
use crate::{Error, Result};

/// Classification of a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Connection reset, DNS, broken stream
    Transport,
    /// Server overloaded or 5xx
    Overloaded,
    /// Too many requests
    RateLimited,
    /// Request timed out upstream
    Timeout,
    /// Reply did not match the expected contract
    MalformedContract,
    /// Bad or missing credentials
    Auth,
    /// Request rejected as invalid
    InvalidRequest,
    /// Account quota exhausted
    Quota,
}

impl BackendErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendErrorKind::Transport
                | BackendErrorKind::Overloaded
                | BackendErrorKind::RateLimited
                | BackendErrorKind::Timeout
                | BackendErrorKind::MalformedContract
        )
    }

    /// Classify an HTTP error status
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => BackendErrorKind::Auth,
            400 | 404 | 422 => BackendErrorKind::InvalidRequest,
            429 if body.contains("insufficient_quota") => BackendErrorKind::Quota,
            429 => BackendErrorKind::RateLimited,
            408 => BackendErrorKind::Timeout,
            500..=599 => BackendErrorKind::Overloaded,
            _ => BackendErrorKind::Transport,
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendErrorKind::Transport => "transport",
            BackendErrorKind::Overloaded => "overloaded",
            BackendErrorKind::RateLimited => "rate limited",
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::MalformedContract => "malformed contract",
            BackendErrorKind::Auth => "auth",
            BackendErrorKind::InvalidRequest => "invalid request",
            BackendErrorKind::Quota => "quota",
        };
        write!(f, "{}", name)
    }
}

/// Tool definition exposed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One model call
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: Option<u32>,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
            tools: Vec::new(),
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }
}

/// Incremental event from a streaming backend
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Text(String),
    ToolCall(ToolUse),
    /// A server-side tool answered inline
    ToolResponse { tool_use_id: String, content: String },
    Stop(StopReason),
}

/// Stream of backend events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ModelEvent>> + Send>>;

/// Core backend trait
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Model identifier
    fn model(&self) -> &str;

    /// Produce one assistant message
    async fn complete(&self, request: &ModelRequest, abort: &AbortScope)
        -> Result<AssistantMessage>;

    /// Stream events for one assistant message
    async fn stream(&self, request: &ModelRequest, abort: &AbortScope) -> Result<EventStream> {
        let message = self.complete(request, abort).await?;
        Ok(Box::pin(stream::iter(
            message_events(message).into_iter().map(Ok),
        )))
    }
}

/// Replay a finished message as events
pub fn message_events(message: AssistantMessage) -> Vec<ModelEvent> {
    let mut events: Vec<ModelEvent> = message
        .text
        .into_iter()
        .filter(|t| !t.is_empty())
        .map(ModelEvent::Text)
        .collect();
    events.extend(message.tool_uses.into_iter().map(ModelEvent::ToolCall));
    events.push(ModelEvent::Stop(message.stop.reason));
    events
}

/// Fold an event stream into an assistant message, charging every event
/// and tool call to `budget`
pub async fn drain_events(mut events: EventStream, budget: &BudgetHandle) -> Result<AssistantMessage> {
    let mut text = String::new();
    let mut tool_uses = Vec::new();
    let mut stop = None;

    while let Some(event) = events.next().await {
        let event = event?;
        budget.record_event()?;
        match event {
            ModelEvent::Text(delta) => text.push_str(&delta),
            ModelEvent::ToolCall(tool_use) => {
                budget.record_tool_call()?;
                tool_uses.push(tool_use);
            }
            ModelEvent::ToolResponse { .. } => {}
            ModelEvent::Stop(reason) => stop = Some(reason),
        }
    }

    let reason = stop.unwrap_or(if tool_uses.is_empty() {
        StopReason::EndTurn
    } else {
        StopReason::ToolUse
    });
    let text = if text.is_empty() { Vec::new() } else { vec![text] };
    Ok(AssistantMessage::new(text, tool_uses, reason))
}

/// Primary backend plus an optional fallback, swapped in at most once
pub struct FailoverSlot {
    primary: Arc<dyn ModelBackend>,
    fallback: Option<Arc<dyn ModelBackend>>,
    swapped: AtomicBool,
}

impl FailoverSlot {
    pub fn new(primary: Arc<dyn ModelBackend>) -> Self {
        Self {
            primary,
            fallback: None,
            swapped: AtomicBool::new(false),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ModelBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Backend to use right now
    pub fn current(&self) -> Arc<dyn ModelBackend> {
        match (&self.fallback, self.swapped.load(Ordering::SeqCst)) {
            (Some(fallback), true) => fallback.clone(),
            _ => self.primary.clone(),
        }
    }

    /// Swap to the fallback. Returns true only for the call that swapped.
    pub fn failover(&self) -> bool {
        let Some(fallback) = &self.fallback else {
            return false;
        };
        let swapped = self
            .swapped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            warn!(
                "Failing over from {} ({}) to {} ({})",
                self.primary.name(),
                self.primary.model(),
                fallback.name(),
                fallback.model()
            );
        }
        swapped
    }

    pub fn has_failed_over(&self) -> bool {
        self.swapped.load(Ordering::SeqCst)
    }
}

/// Build the configured backend slot
pub fn create_backend(config: &BackendConfig) -> Result<FailoverSlot> {
    match config.kind {
        BackendKind::Openai => {
            let primary = OpenAiBackend::new(config, &config.model)?;
            info!("Using OpenAI-compatible backend with model {}", config.model);
            let mut slot = FailoverSlot::new(Arc::new(primary));
            if let Some(fallback_model) = &config.fallback_model {
                slot = slot.with_fallback(Arc::new(OpenAiBackend::new(config, fallback_model)?));
            }
            Ok(slot)
        }
    }
}

/// Error for a backend call that ended because its scope was aborted
pub(crate) fn aborted(abort: &AbortScope) -> Error {
    abort
        .cause()
        .map(|cause| Error::from_abort(&cause))
        .unwrap_or(Error::Cancelled)
}
