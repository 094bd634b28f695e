//! Tools the model can call
//!
//! A tool declares its input schema and whether a given input is safe to
//! run alongside other safe calls. It emits progress while running and
//! finishes with exactly one [`ToolOutput`]. A tool that changes the
//! environment returns a [`ContextPatch`] instead of mutating shared state.

mod ask_user;
mod bash;
mod runner;
mod search;
mod stages;
#[cfg(any(test, feature = "test-support"))]
mod scripted;
mod validate;

pub use ask_user::{AskUserTool, NoPrompter, Question, QuestionOption, UserPrompter};
pub use bash::BashTool;
pub use runner::{ToolRunOutcome, ToolRunner};
pub use search::SearchTool;
pub use stages::{StageServices, StageTool};
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{ConcurrencyProbe, ScriptedTool};
pub use validate::{validate_input, Validated};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::backend::ToolSchema;
use crate::budget::AbortScope;
use crate::config::Config;
use crate::evidence::{Evidence, StageKind};
use crate::session::SessionContext;
use crate::transcript::{Message, ToolUse};
use crate::Result;

/// A change to the shared tool context, applied by the queue owner
#[derive(Debug, Clone, PartialEq)]
pub enum ContextPatch {
    SetCwd(PathBuf),
    SetEnv { key: String, value: String },
    AddNote(String),
}

/// Environment tools run in; updated only through patches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolUseContext {
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub notes: Vec<String>,
}

impl ToolUseContext {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Self::default()
        }
    }

    /// Context rooted at the process working directory
    pub fn current_dir() -> Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn apply(&mut self, patch: &ContextPatch) {
        match patch {
            ContextPatch::SetCwd(dir) => self.cwd = dir.clone(),
            ContextPatch::SetEnv { key, value } => {
                self.env.insert(key.clone(), value.clone());
            }
            ContextPatch::AddNote(note) => self.notes.push(note.clone()),
        }
    }
}

/// Everything a tool call gets besides its input
#[derive(Clone)]
pub struct ToolContext {
    pub tool_use_id: String,
    /// Snapshot of the shared context when the call started
    pub context: ToolUseContext,
    pub session: Arc<SessionContext>,
    /// Aborted when the turn is cancelled
    pub abort: AbortScope,
}

/// Terminal result of a tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    pub evidence: Option<Evidence>,
    pub patch: Option<ContextPatch>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            evidence: None,
            patch: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::success(content)
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn with_patch(mut self, patch: ContextPatch) -> Self {
        self.patch = Some(patch);
        self
    }
}

/// Progress emitted by a running tool
#[derive(Debug)]
pub struct ProgressEvent {
    /// Queue position of the emitting entry
    pub index: usize,
    pub message: Message,
}

/// Where a tool sends progress lines
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    index: usize,
    tool_use_id: String,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>, index: usize, tool_use_id: &str) -> Self {
        Self {
            tx: Some(tx),
            index,
            tool_use_id: tool_use_id.to_string(),
        }
    }

    /// Sink that drops everything
    pub fn discard() -> Self {
        Self {
            tx: None,
            index: 0,
            tool_use_id: String::new(),
        }
    }

    pub fn send(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let message = Message::progress(Some(&self.tool_use_id), text);
            // Receiver gone means the queue was dropped; nothing to report to
            let _ = tx.send(ProgressEvent {
                index: self.index,
                message,
            });
        }
    }
}

/// Core tool trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model calls
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the input
    fn input_schema(&self) -> Value;

    /// Whether this input may run in parallel with other safe calls
    fn is_concurrency_safe(&self, input: &Value) -> bool;

    /// Semantic checks beyond the schema
    async fn validate_input(&self, _input: &Value, _ctx: &ToolContext) -> Result<()> {
        Ok(())
    }

    /// Run the tool
    async fn call(&self, input: Value, ctx: &ToolContext, progress: &ProgressSink)
        -> Result<ToolOutput>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Tools by name, in registration order
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in tools: shell, search, user questions and the stage suite
    pub fn with_builtins(
        config: &Config,
        stages: Arc<StageServices>,
        prompter: Arc<dyn UserPrompter>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BashTool::new(config.tools.bash_timeout)));
        registry.register(Arc::new(SearchTool::new(config.tools.search_max_results)));
        registry.register(Arc::new(AskUserTool::new(prompter)));
        for stage in StageKind::ALL {
            registry.register(Arc::new(StageTool::new(stage, stages.clone())));
        }
        registry
    }

    /// Add a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    /// Safety of a request; unknown tools are treated as unsafe
    pub fn is_concurrency_safe(&self, tool_use: &ToolUse) -> bool {
        self.get(&tool_use.name)
            .map(|t| t.is_concurrency_safe(&tool_use.input))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_patches_apply_in_order() {
        let mut ctx = ToolUseContext::new(PathBuf::from("/a"));
        ctx.apply(&ContextPatch::SetCwd(PathBuf::from("/b")));
        ctx.apply(&ContextPatch::SetEnv {
            key: "MODE".to_string(),
            value: "1".to_string(),
        });
        ctx.apply(&ContextPatch::SetCwd(PathBuf::from("/c")));
        ctx.apply(&ContextPatch::AddNote("checked".to_string()));

        assert_eq!(ctx.cwd, PathBuf::from("/c"));
        assert_eq!(ctx.env.get("MODE").map(String::as_str), Some("1"));
        assert_eq!(ctx.notes, vec!["checked".to_string()]);
    }

    #[test]
    fn test_registry_replaces_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool::new("Echo", true)));
        registry.register(Arc::new(ScriptedTool::new("Echo", false)));
        assert_eq!(registry.names(), vec!["Echo".to_string()]);

        let tool_use = ToolUse::new("Echo", serde_json::json!({}));
        assert!(!registry.is_concurrency_safe(&tool_use));
        assert!(!registry.is_concurrency_safe(&ToolUse::new("Missing", serde_json::json!({}))));
    }

    #[tokio::test]
    async fn test_progress_sink_tags_index() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(tx, 3, "toolu_1");
        sink.send("halfway");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.index, 3);
        match event.message {
            Message::Progress(p) => {
                assert_eq!(p.text, "halfway");
                assert_eq!(p.tool_use_id.as_deref(), Some("toolu_1"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        ProgressSink::discard().send("dropped");
    }
}
