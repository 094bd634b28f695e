//! Transcript messages and session persistence
//!
//! A transcript is an ordered list of [`Message`]s:
//! - **User**: a prompt, or the results of the previous assistant's tool calls
//! - **Assistant**: text plus zero or more tool-invocation requests
//! - **Progress**: ephemeral tool progress, never persisted
//!
//! Every tool result answers exactly one request from the assistant message
//! immediately before it.

mod store;

pub use store::{SessionSummary, TranscriptStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::evidence::{Evidence, Obligation};

/// One transcript message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    Progress(ProgressMessage),
}

impl Message {
    /// A plain user prompt
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage::new(vec![UserContent::Text { text: text.into() }]))
    }

    /// A meta user message (hook context, reminders) the model sees but the
    /// user did not type
    pub fn user_meta(text: impl Into<String>) -> Self {
        let mut message = UserMessage::new(vec![UserContent::Text { text: text.into() }]);
        message.is_meta = true;
        Message::User(message)
    }

    /// A user message carrying one tool result
    pub fn tool_result(block: ToolResultBlock) -> Self {
        Message::User(UserMessage::new(vec![UserContent::ToolResult(block)]))
    }

    /// An assistant message with only text
    pub fn assistant_text(text: impl Into<String>, reason: StopReason) -> Self {
        Message::Assistant(AssistantMessage::text(text, reason))
    }

    /// A progress line, optionally tied to a tool invocation
    pub fn progress(tool_use_id: Option<&str>, text: impl Into<String>) -> Self {
        Message::Progress(ProgressMessage {
            tool_use_id: tool_use_id.map(str::to_string),
            text: text.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, Message::Progress(_))
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Message::User(u) => Some(u),
            _ => None,
        }
    }

    /// Tool result blocks carried by this message
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultBlock> {
        self.as_user()
            .into_iter()
            .flat_map(|u| u.content.iter())
            .filter_map(|c| match c {
                UserContent::ToolResult(block) => Some(block),
                _ => None,
            })
    }
}

/// User-side message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub content: Vec<UserContent>,
    /// Injected by the system rather than typed by the user
    #[serde(default)]
    pub is_meta: bool,
}

impl UserMessage {
    pub fn new(content: Vec<UserContent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            content,
            is_meta: false,
        }
    }

    /// A prompt typed by the user: text only, not meta
    pub fn is_prompt(&self) -> bool {
        !self.is_meta
            && !self.content.is_empty()
            && self
                .content
                .iter()
                .all(|c| matches!(c, UserContent::Text { .. }))
    }

    /// Concatenated text content
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                UserContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A block of user content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserContent {
    Text { text: String },
    ToolResult(ToolResultBlock),
}

/// Why a tool result was synthesized instead of produced by the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticReason {
    UserInterrupted,
    SiblingError,
}

impl SyntheticReason {
    pub fn tag(&self) -> &'static str {
        match self {
            SyntheticReason::UserInterrupted => "user_interrupted",
            SyntheticReason::SiblingError => "sibling_error",
        }
    }
}

/// Result of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub tool_name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    /// Typed projection of the tool's structured output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
    /// Set when the queue resolved this entry without running it to completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<SyntheticReason>,
    /// Context added by post-tool-use hooks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_context: Vec<String>,
}

impl ToolResultBlock {
    pub fn success(tool_use: &ToolUse, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use.id.clone(),
            tool_name: tool_use.name.clone(),
            content: content.into(),
            is_error: false,
            evidence: None,
            synthetic: None,
            additional_context: Vec::new(),
        }
    }

    pub fn error(tool_use: &ToolUse, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::success(tool_use, content)
        }
    }

    /// Error result standing in for a tool that never ran to completion
    pub fn synthetic(tool_use: &ToolUse, reason: SyntheticReason) -> Self {
        let content = match reason {
            SyntheticReason::UserInterrupted => {
                "<tool_use_error>Interrupted by user</tool_use_error>".to_string()
            }
            SyntheticReason::SiblingError => {
                "<tool_use_error>Cancelled: a parallel tool call errored</tool_use_error>"
                    .to_string()
            }
        };
        Self {
            synthetic: Some(reason),
            ..Self::error(tool_use, content)
        }
    }

    /// Content as the model should see it, hook context included
    pub fn rendered_content(&self) -> String {
        if self.additional_context.is_empty() {
            return self.content.clone();
        }
        let mut out = self.content.clone();
        for ctx in &self.additional_context {
            out.push_str("\n\n<system-reminder>\n");
            out.push_str(ctx);
            out.push_str("\n</system-reminder>");
        }
        out
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolUse {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            id: format!("toolu_{}", Uuid::new_v4().simple()),
            name: name.into(),
            input,
        }
    }
}

/// Why the model stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Interrupted,
    Error,
}

/// Stop metadata attached to an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopMetadata {
    pub reason: StopReason,
    #[serde(default)]
    pub model: Option<String>,
    /// Tool uses were appended by the evidence gate, not requested
    #[serde(default)]
    pub synthesized: bool,
    /// The obligation this message hard-blocks on
    #[serde(default)]
    pub hard_block: Option<Obligation>,
}

impl StopMetadata {
    pub fn new(reason: StopReason) -> Self {
        Self {
            reason,
            model: None,
            synthesized: false,
            hard_block: None,
        }
    }
}

/// Assistant-side message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: Vec<String>,
    #[serde(default)]
    pub tool_uses: Vec<ToolUse>,
    pub stop: StopMetadata,
    /// Produced from a backend failure rather than the model
    #[serde(default)]
    pub is_api_error: bool,
}

impl AssistantMessage {
    pub fn new(text: Vec<String>, tool_uses: Vec<ToolUse>, reason: StopReason) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            text,
            tool_uses,
            stop: StopMetadata::new(reason),
            is_api_error: false,
        }
    }

    pub fn text(text: impl Into<String>, reason: StopReason) -> Self {
        Self::new(vec![text.into()], Vec::new(), reason)
    }

    pub fn has_tool_uses(&self) -> bool {
        !self.tool_uses.is_empty()
    }

    /// All text segments joined
    pub fn joined_text(&self) -> String {
        self.text.join("")
    }

    /// No visible text and no tool calls
    pub fn is_empty(&self) -> bool {
        self.tool_uses.is_empty() && self.text.iter().all(|t| t.trim().is_empty())
    }
}

/// Ephemeral progress from a running tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    #[serde(default)]
    pub tool_use_id: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A session's transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Session ID
    pub id: String,
    /// When the session started
    pub started: DateTime<Utc>,
    /// When the session was last saved
    pub updated: DateTime<Utc>,
    /// Short title taken from the first prompt
    #[serde(default)]
    pub title: Option<String>,
    /// Messages, progress excluded once persisted
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Transcript {
    /// Create a new transcript
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            started: now,
            updated: now,
            title: None,
            messages: Vec::new(),
        }
    }

    /// Create with a given session id
    pub fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::new()
        }
    }

    /// Append a message; the first prompt becomes the title
    pub fn push(&mut self, message: Message) {
        if self.title.is_none() {
            if let Message::User(user) = &message {
                if user.is_prompt() {
                    self.title = Some(truncate(&user.text(), 60));
                }
            }
        }
        self.messages.push(message);
    }

    /// Messages that survive persistence
    pub fn persisted(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_progress())
            .cloned()
            .collect()
    }

    /// Drop progress messages in place
    pub fn compact(&mut self) {
        self.messages.retain(|m| !m.is_progress());
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
