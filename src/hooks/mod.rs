//! Permission and lifecycle hooks
//!
//! Hooks see every tool call before and after it runs, and every attempt by
//! the model to stop. Only the call contract lives here; the policy comes
//! from whatever implements [`Hooks`] (by default, nothing).

mod command;

pub use command::CommandHooks;

use async_trait::async_trait;
use serde_json::Value;

use crate::session::SessionContext;
use crate::transcript::{AssistantMessage, ToolResultBlock, ToolUse};
use crate::Result;

/// Pre-tool-use verdict
#[derive(Debug, Clone, PartialEq)]
pub enum PreToolDecision {
    Allow,
    /// Run with a replacement input
    AllowWithInput(Value),
    /// Ask the user before running
    Ask { reason: String },
    /// Refuse; the message becomes the tool's error result
    Block { message: String },
}

/// Stop verdict
#[derive(Debug, Clone, PartialEq)]
pub enum StopDecision {
    Allow,
    /// Keep going; the reason is shown to the model
    Continue { reason: String },
}

/// Lifecycle hooks
#[async_trait]
pub trait Hooks: Send + Sync {
    async fn pre_tool_use(
        &self,
        _tool_use: &ToolUse,
        _session: &SessionContext,
    ) -> Result<PreToolDecision> {
        Ok(PreToolDecision::Allow)
    }

    /// Extra context to attach to the tool result
    async fn post_tool_use(
        &self,
        _tool_use: &ToolUse,
        _result: &ToolResultBlock,
        _session: &SessionContext,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn on_stop(
        &self,
        _message: &AssistantMessage,
        _session: &SessionContext,
    ) -> Result<StopDecision> {
        Ok(StopDecision::Allow)
    }
}

/// Hooks that allow everything
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Resolves `Ask` decisions
#[async_trait]
pub trait PermissionPrompter: Send + Sync {
    /// Whether the user allows `tool_use`
    async fn confirm(&self, tool_use: &ToolUse, reason: &str) -> bool;
}

/// Denies every request; used when nobody is at the terminal
pub struct DenyAll;

#[async_trait]
impl PermissionPrompter for DenyAll {
    async fn confirm(&self, tool_use: &ToolUse, reason: &str) -> bool {
        tracing::info!("Denying {} without a user to ask: {}", tool_use.name, reason);
        false
    }
}

/// Allows every request
pub struct AllowAll;

#[async_trait]
impl PermissionPrompter for AllowAll {
    async fn confirm(&self, _tool_use: &ToolUse, _reason: &str) -> bool {
        true
    }
}
