//! Running one tool call end to end
//!
//! lookup → schema check → semantic check → pre hook / permission → call →
//! evidence ingestion → post hook. Every failure along the way becomes an
//! error result; nothing here aborts sibling calls.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{validate_input, ContextPatch, ProgressSink, ToolContext, ToolRegistry, Validated};
use crate::evidence::Evidence;
use crate::hooks::{Hooks, NoHooks, PermissionPrompter, PreToolDecision, DenyAll};
use crate::transcript::{SyntheticReason, ToolResultBlock, ToolUse};

/// Result of running one tool call
#[derive(Debug, Clone)]
pub struct ToolRunOutcome {
    pub block: ToolResultBlock,
    pub patch: Option<ContextPatch>,
}

impl ToolRunOutcome {
    fn error(tool_use: &ToolUse, message: impl Into<String>) -> Self {
        Self {
            block: ToolResultBlock::error(
                tool_use,
                format!("<tool_use_error>{}</tool_use_error>", message.into()),
            ),
            patch: None,
        }
    }
}

/// Runs tool calls against a registry, with hooks and permissions
pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    hooks: Arc<dyn Hooks>,
    permissions: Arc<dyn PermissionPrompter>,
}

impl ToolRunner {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            hooks: Arc::new(NoHooks),
            permissions: Arc::new(DenyAll),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionPrompter>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        &self.hooks
    }

    /// Run `tool_use` to a terminal result
    pub async fn run(
        &self,
        tool_use: &ToolUse,
        ctx: &ToolContext,
        progress: &ProgressSink,
    ) -> ToolRunOutcome {
        let Some(tool) = self.registry.get(&tool_use.name) else {
            return ToolRunOutcome::error(
                tool_use,
                format!("Error: No such tool available: {}", tool_use.name),
            );
        };

        let schema = tool.input_schema();
        let input = match validate_input(&schema, tool_use.input.clone()) {
            Ok(Validated::Unchanged(input)) => input,
            Ok(Validated::Stripped { input, removed }) => {
                debug!("{}: ignored unknown fields {:?}", tool_use.name, removed);
                input
            }
            Err(e) => return ToolRunOutcome::error(tool_use, e.to_string()),
        };
        if let Err(e) = tool.validate_input(&input, ctx).await {
            return ToolRunOutcome::error(tool_use, e.to_string());
        }

        // Hooks and permission prompts see the input that will actually run
        let checked = ToolUse {
            input,
            ..tool_use.clone()
        };
        let input = match self.hooks.pre_tool_use(&checked, &ctx.session).await {
            Ok(PreToolDecision::Allow) => checked.input,
            Ok(PreToolDecision::AllowWithInput(replacement)) => {
                match validate_input(&schema, replacement) {
                    Ok(validated) => validated.into_input(),
                    Err(e) => {
                        return ToolRunOutcome::error(
                            tool_use,
                            format!("Hook supplied invalid input: {}", e),
                        )
                    }
                }
            }
            Ok(PreToolDecision::Ask { reason }) => {
                if self.permissions.confirm(&checked, &reason).await {
                    checked.input
                } else {
                    info!("Permission denied for {}", tool_use.name);
                    return ToolRunOutcome::error(
                        tool_use,
                        format!("Permission to use {} was denied", tool_use.name),
                    );
                }
            }
            Ok(PreToolDecision::Block { message }) => {
                info!("{} blocked by hook", tool_use.name);
                return ToolRunOutcome::error(tool_use, message);
            }
            Err(e) => {
                warn!("pre_tool_use hook failed, allowing {}: {}", tool_use.name, e);
                checked.input
            }
        };

        let output = match tool.call(input, ctx, progress).await {
            Ok(output) => output,
            Err(e) if e.is_cancelled() || ctx.abort.is_aborted() => {
                return ToolRunOutcome {
                    block: ToolResultBlock::synthetic(tool_use, SyntheticReason::UserInterrupted),
                    patch: None,
                };
            }
            Err(e) => {
                warn!("{} failed: {}", tool_use.name, e);
                return ToolRunOutcome::error(tool_use, e.to_string());
            }
        };

        let mut block = if output.is_error {
            ToolResultBlock::error(tool_use, output.content)
        } else {
            ToolResultBlock::success(tool_use, output.content)
        };
        block.evidence = match output.evidence {
            Some(evidence) => Some(evidence),
            None if !block.is_error => Evidence::ingest(&tool_use.name, &block.content),
            None => None,
        };

        match self.hooks.post_tool_use(tool_use, &block, &ctx.session).await {
            Ok(context) => block.additional_context = context,
            Err(e) => warn!("post_tool_use hook failed for {}: {}", tool_use.name, e),
        }

        ToolRunOutcome {
            block,
            patch: output.patch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::AbortScope;
    use crate::hooks::AllowAll;
    use crate::session::SessionContext;
    use crate::tools::{ScriptedTool, ToolUseContext};
    use crate::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct FixedHooks(PreToolDecision);

    #[async_trait]
    impl Hooks for FixedHooks {
        async fn pre_tool_use(
            &self,
            _tool_use: &ToolUse,
            _session: &SessionContext,
        ) -> Result<PreToolDecision> {
            Ok(self.0.clone())
        }

        async fn post_tool_use(
            &self,
            _tool_use: &ToolUse,
            _result: &ToolResultBlock,
            _session: &SessionContext,
        ) -> Result<Vec<String>> {
            Ok(vec!["checked by hook".to_string()])
        }
    }

    fn runner() -> ToolRunner {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool::new("Echo", true)));
        ToolRunner::new(Arc::new(registry))
    }

    fn ctx() -> ToolContext {
        ToolContext {
            tool_use_id: "toolu_1".to_string(),
            context: ToolUseContext::default(),
            session: Arc::new(SessionContext::new(
                "s1",
                "ana",
                "popper",
                Duration::from_secs(60),
            )),
            abort: AbortScope::new(),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error_result() {
        let tool_use = ToolUse::new("Nope", json!({}));
        let outcome = runner().run(&tool_use, &ctx(), &ProgressSink::discard()).await;
        assert!(outcome.block.is_error);
        assert!(outcome.block.content.contains("No such tool"));
    }

    #[tokio::test]
    async fn test_block_hook_stops_call() {
        let runner = runner().with_hooks(Arc::new(FixedHooks(PreToolDecision::Block {
            message: "not today".to_string(),
        })));
        let tool_use = ToolUse::new("Echo", json!({"content": "hi"}));
        let outcome = runner.run(&tool_use, &ctx(), &ProgressSink::discard()).await;
        assert!(outcome.block.is_error);
        assert!(outcome.block.content.contains("not today"));
    }

    #[tokio::test]
    async fn test_ask_resolved_by_prompter() {
        let ask = PreToolDecision::Ask {
            reason: "sure?".to_string(),
        };
        let tool_use = ToolUse::new("Echo", json!({"content": "hi"}));

        let denied = runner().with_hooks(Arc::new(FixedHooks(ask.clone())));
        let outcome = denied.run(&tool_use, &ctx(), &ProgressSink::discard()).await;
        assert!(outcome.block.is_error);

        let allowed = runner()
            .with_hooks(Arc::new(FixedHooks(ask)))
            .with_permissions(Arc::new(AllowAll));
        let outcome = allowed.run(&tool_use, &ctx(), &ProgressSink::discard()).await;
        assert!(!outcome.block.is_error);
        assert_eq!(outcome.block.content, "hi");
        assert_eq!(outcome.block.additional_context, vec!["checked by hook".to_string()]);
    }

    #[derive(Default)]
    struct RecordingHooks {
        seen: std::sync::Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Hooks for RecordingHooks {
        async fn pre_tool_use(
            &self,
            tool_use: &ToolUse,
            _session: &SessionContext,
        ) -> Result<PreToolDecision> {
            self.seen.lock().unwrap().push(tool_use.input.clone());
            Ok(PreToolDecision::Allow)
        }
    }

    #[tokio::test]
    async fn test_pre_hook_sees_stripped_input() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool::new("Strict", true).with_schema(json!({
            "type": "object",
            "properties": {"content": {"type": "string"}},
            "additionalProperties": false
        }))));
        let hooks = Arc::new(RecordingHooks::default());
        let runner = ToolRunner::new(Arc::new(registry)).with_hooks(hooks.clone());

        let tool_use = ToolUse::new("Strict", json!({"content": "hi", "verbose": true}));
        let outcome = runner.run(&tool_use, &ctx(), &ProgressSink::discard()).await;

        assert!(!outcome.block.is_error);
        assert_eq!(outcome.block.tool_use_id, tool_use.id);
        assert_eq!(*hooks.seen.lock().unwrap(), vec![json!({"content": "hi"})]);
    }

    #[tokio::test]
    async fn test_hook_can_rewrite_input() {
        let runner = runner().with_hooks(Arc::new(FixedHooks(
            PreToolDecision::AllowWithInput(json!({"content": "rewritten"})),
        )));
        let tool_use = ToolUse::new("Echo", json!({"content": "original"}));
        let outcome = runner.run(&tool_use, &ctx(), &ProgressSink::discard()).await;
        assert_eq!(outcome.block.content, "rewritten");
    }

    #[tokio::test]
    async fn test_patch_and_stage_evidence_flow_through() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool::new("FalsificationPlan", false)));
        let runner = ToolRunner::new(Arc::new(registry));

        let tool_use = ToolUse::new(
            "FalsificationPlan",
            json!({"content": r#"{"status":"ready"}"#, "cwd": "/tmp"}),
        );
        let outcome = runner.run(&tool_use, &ctx(), &ProgressSink::discard()).await;
        assert!(outcome.block.evidence.is_some());
        assert_eq!(
            outcome.patch,
            Some(ContextPatch::SetCwd(std::path::PathBuf::from("/tmp")))
        );
    }

    #[tokio::test]
    async fn test_cancelled_call_is_user_interrupted() {
        let context = ctx();
        context.abort.abort(crate::budget::AbortCause::UserInterrupt);
        let tool_use = ToolUse::new("Echo", json!({"hang": true}));
        let outcome = runner().run(&tool_use, &context, &ProgressSink::discard()).await;
        assert_eq!(outcome.block.synthetic, Some(SyntheticReason::UserInterrupted));
    }
}
