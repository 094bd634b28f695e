//! Hooks backed by external commands
//!
//! Each configured command gets a JSON payload on stdin. Exit code 0 with
//! JSON on stdout decides; empty stdout allows. Exit code 2 blocks, with
//! stderr as the message. Any other failure is logged and ignored.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Hooks, PreToolDecision, StopDecision};
use crate::config::HooksConfig;
use crate::session::SessionContext;
use crate::transcript::{AssistantMessage, ToolResultBlock, ToolUse};
use crate::{Error, Result};

/// Exit code meaning "block"
const BLOCK_EXIT_CODE: i32 = 2;

#[derive(Debug, Default, Deserialize)]
struct HookReply {
    #[serde(default)]
    decision: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    additional_context: Option<String>,
}

enum HookRun {
    Reply(HookReply),
    Blocked(String),
}

/// Hooks that shell out to configured commands
pub struct CommandHooks {
    pre_tool_use: Vec<String>,
    post_tool_use: Vec<String>,
    stop: Vec<String>,
    timeout: Duration,
}

impl CommandHooks {
    pub fn new(config: &HooksConfig) -> Self {
        Self {
            pre_tool_use: config.pre_tool_use.clone(),
            post_tool_use: config.post_tool_use.clone(),
            stop: config.stop.clone(),
            timeout: config.timeout,
        }
    }

    async fn run(&self, command: &str, payload: &Value) -> Result<HookRun> {
        let argv = shell_words::split(command)
            .map_err(|e| Error::Hook(format!("cannot parse hook {:?}: {}", command, e)))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Hook("empty hook command".to_string()))?;

        debug!("Running hook: {}", command);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Hook(format!("failed to spawn {}: {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(payload)?;
            // Hooks that never read stdin may exit before we finish writing
            if let Err(e) = stdin.write_all(&body).await {
                debug!("Hook {} did not take its payload: {}", command, e);
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Hook(format!("hook timed out: {}", command)))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(0) => {
                if stdout.trim().is_empty() {
                    return Ok(HookRun::Reply(HookReply::default()));
                }
                let reply = serde_json::from_str(stdout.trim()).map_err(|e| {
                    Error::Hook(format!("hook {} printed invalid JSON: {}", command, e))
                })?;
                Ok(HookRun::Reply(reply))
            }
            Some(BLOCK_EXIT_CODE) => Ok(HookRun::Blocked(stderr.trim().to_string())),
            other => Err(Error::Hook(format!(
                "hook {} exited with {:?}: {}",
                command,
                other,
                stderr.trim()
            ))),
        }
    }
}

#[async_trait]
impl Hooks for CommandHooks {
    async fn pre_tool_use(
        &self,
        tool_use: &ToolUse,
        session: &SessionContext,
    ) -> Result<PreToolDecision> {
        let payload = json!({
            "event": "pre_tool_use",
            "session_id": session.id,
            "tool_name": tool_use.name,
            "tool_input": tool_use.input,
        });

        let mut decision = PreToolDecision::Allow;
        for command in &self.pre_tool_use {
            let reply = match self.run(command, &payload).await {
                Ok(HookRun::Blocked(message)) => {
                    info!("Hook blocked {}: {}", tool_use.name, message);
                    return Ok(PreToolDecision::Block { message });
                }
                Ok(HookRun::Reply(reply)) => reply,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };

            match reply.decision.as_deref() {
                Some("block") | Some("deny") => {
                    return Ok(PreToolDecision::Block {
                        message: reply
                            .reason
                            .unwrap_or_else(|| format!("{} blocked by hook", tool_use.name)),
                    });
                }
                Some("ask") => {
                    decision = PreToolDecision::Ask {
                        reason: reply.reason.unwrap_or_default(),
                    };
                }
                _ => {
                    if let Some(input) = reply.input {
                        decision = PreToolDecision::AllowWithInput(input);
                    }
                }
            }
        }
        Ok(decision)
    }

    async fn post_tool_use(
        &self,
        tool_use: &ToolUse,
        result: &ToolResultBlock,
        session: &SessionContext,
    ) -> Result<Vec<String>> {
        let payload = json!({
            "event": "post_tool_use",
            "session_id": session.id,
            "tool_name": tool_use.name,
            "tool_input": tool_use.input,
            "tool_response": result.content,
            "is_error": result.is_error,
        });

        let mut context = Vec::new();
        for command in &self.post_tool_use {
            match self.run(command, &payload).await {
                Ok(HookRun::Reply(reply)) => context.extend(reply.additional_context),
                Ok(HookRun::Blocked(message)) if !message.is_empty() => context.push(message),
                Ok(HookRun::Blocked(_)) => {}
                Err(e) => warn!("{}", e),
            }
        }
        Ok(context)
    }

    async fn on_stop(
        &self,
        message: &AssistantMessage,
        session: &SessionContext,
    ) -> Result<StopDecision> {
        let payload = json!({
            "event": "stop",
            "session_id": session.id,
            "response": message.joined_text(),
        });

        for command in &self.stop {
            match self.run(command, &payload).await {
                Ok(HookRun::Blocked(reason)) => return Ok(StopDecision::Continue { reason }),
                Ok(HookRun::Reply(reply)) => {
                    if matches!(reply.decision.as_deref(), Some("continue") | Some("block")) {
                        return Ok(StopDecision::Continue {
                            reason: reply.reason.unwrap_or_default(),
                        });
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }
        Ok(StopDecision::Allow)
    }
}
