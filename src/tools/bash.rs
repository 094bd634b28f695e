//! Shell command tool
//!
//! Commands run through `sh -c` in the context's working directory. A
//! trailing marker reports the final directory so `cd` survives into later
//! calls as a [`ContextPatch`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{ContextPatch, ProgressSink, Tool, ToolContext, ToolOutput};
use crate::transcript::truncate;
use crate::{Error, Result};

const CWD_MARKER: &str = "__POPPER_CWD__";

/// Output beyond this is cut before it reaches the model
const MAX_OUTPUT_CHARS: usize = 30_000;

pub struct BashTool {
    timeout: Duration,
}

impl BashTool {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn script(command: &str) -> String {
        format!(
            "{{\n{}\n}}\n__popper_status=$?\nprintf '\\n{}%s\\n' \"$(pwd)\"\nexit $__popper_status",
            command, CWD_MARKER
        )
    }
}

/// Split the cwd marker off stdout
fn split_marker(stdout: &str) -> (String, Option<PathBuf>) {
    match stdout.rfind(CWD_MARKER) {
        Some(pos) => {
            let cwd = stdout[pos + CWD_MARKER.len()..].trim();
            let body = stdout[..pos].trim_end_matches('\n').to_string();
            let cwd = (!cwd.is_empty()).then(|| PathBuf::from(cwd));
            (body, cwd)
        }
        None => (stdout.to_string(), None),
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "Bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory and return its output"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "minLength": 1},
                "timeout_secs": {"type": "integer", "minimum": 1}
            },
            "required": ["command"]
        })
    }

    fn is_concurrency_safe(&self, _input: &Value) -> bool {
        false
    }

    async fn call(
        &self,
        input: Value,
        ctx: &ToolContext,
        progress: &ProgressSink,
    ) -> Result<ToolOutput> {
        let command = input
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Tool("command is required".to_string()))?;
        let timeout = input
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);

        debug!("Running: {}", command);
        progress.send(format!("$ {}", truncate(command, 80)));

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(Self::script(command))
            .envs(&ctx.context.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !ctx.context.cwd.as_os_str().is_empty() {
            cmd.current_dir(&ctx.context.cwd);
        }
        let child = cmd
            .spawn()
            .map_err(|e| Error::Tool(format!("failed to spawn shell: {}", e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = tokio::time::sleep(timeout) => {
                return Ok(ToolOutput::error(format!(
                    "Command timed out after {}",
                    humantime::format_duration(timeout)
                )));
            }
            _ = ctx.abort.cancelled() => return Err(Error::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let (body, cwd) = split_marker(&stdout);

        let mut content = body;
        if !stderr.trim().is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(stderr.trim_end());
        }
        let content = truncate(&content, MAX_OUTPUT_CHARS);

        let mut result = if output.status.success() {
            ToolOutput::success(content)
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            ToolOutput::error(format!("Exit code {}\n{}", code, content))
        };
        if let Some(cwd) = cwd.filter(|dir| *dir != ctx.context.cwd) {
            result = result.with_patch(ContextPatch::SetCwd(cwd));
        }
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::budget::{AbortCause, AbortScope};
    use crate::session::SessionContext;
    use crate::tools::ToolUseContext;
    use std::sync::Arc;

    fn ctx(cwd: PathBuf) -> ToolContext {
        ToolContext {
            tool_use_id: "toolu_b".to_string(),
            context: ToolUseContext::new(cwd),
            session: Arc::new(SessionContext::new("s", "u", "popper", Duration::from_secs(60))),
            abort: AbortScope::new(),
        }
    }

    #[test]
    fn test_split_marker() {
        let (body, cwd) = split_marker("hello\n\n__POPPER_CWD__/tmp/x\n");
        assert_eq!(body, "hello");
        assert_eq!(cwd, Some(PathBuf::from("/tmp/x")));
        assert_eq!(split_marker("plain"), ("plain".to_string(), None));
    }

    #[tokio::test]
    async fn test_echo_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BashTool::new(Duration::from_secs(10));
        let output = tool
            .call(
                json!({"command": "echo hello"}),
                &ctx(dir.path().to_path_buf()),
                &ProgressSink::discard(),
            )
            .await
            .unwrap();
        assert!(!output.is_error);
        assert_eq!(output.content, "hello");
        assert!(output.patch.is_none());
    }

    #[tokio::test]
    async fn test_cd_produces_patch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let tool = BashTool::new(Duration::from_secs(10));
        let output = tool
            .call(
                json!({"command": "cd sub"}),
                &ctx(dir.path().to_path_buf()),
                &ProgressSink::discard(),
            )
            .await
            .unwrap();
        match output.patch {
            Some(ContextPatch::SetCwd(path)) => assert!(path.ends_with("sub")),
            other => panic!("expected cwd patch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BashTool::new(Duration::from_secs(10));
        let output = tool
            .call(
                json!({"command": "echo oops >&2; exit 3"}),
                &ctx(dir.path().to_path_buf()),
                &ProgressSink::discard(),
            )
            .await
            .unwrap();
        assert!(output.is_error);
        assert!(output.content.starts_with("Exit code 3"));
        assert!(output.content.contains("oops"));
    }

    #[tokio::test]
    async fn test_abort_cancels_command() {
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(dir.path().to_path_buf());
        context.abort.abort(AbortCause::UserInterrupt);
        let tool = BashTool::new(Duration::from_secs(10));
        let err = tool
            .call(json!({"command": "sleep 5"}), &context, &ProgressSink::discard())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
