//! Scripted tool for tests
//!
//! Behaviour comes from the call input:
//! `{"delay_ms": 50, "content": "x", "fail": false, "progress": ["a"],
//!   "cwd": "/tmp", "hang": false}`.
//! An optional [`ConcurrencyProbe`] records overlapping runs.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ContextPatch, ProgressSink, Tool, ToolContext, ToolOutput};
use crate::{Error, Result};

/// Records which calls overlap in time
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    state: Mutex<ProbeState>,
}

#[derive(Debug, Default)]
struct ProbeState {
    running: Vec<(String, bool)>,
    violations: Vec<String>,
    started: Vec<String>,
    max_parallel: usize,
}

impl ConcurrencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self, label: &str, safe: bool) {
        if let Ok(mut state) = self.state.lock() {
            let unsafe_running = state.running.iter().any(|(_, s)| !s);
            if unsafe_running || (!safe && !state.running.is_empty()) {
                let running: Vec<String> = state.running.iter().map(|(l, _)| l.clone()).collect();
                state
                    .violations
                    .push(format!("{} started while {:?} running", label, running));
            }
            state.running.push((label.to_string(), safe));
            state.started.push(label.to_string());
            state.max_parallel = state.max_parallel.max(state.running.len());
        }
    }

    fn exit(&self, label: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(pos) = state.running.iter().position(|(l, _)| l == label) {
                state.running.remove(pos);
            }
        }
    }

    /// Overlaps that broke the safety rule
    pub fn violations(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.violations.clone())
            .unwrap_or_default()
    }

    /// Labels in start order
    pub fn started(&self) -> Vec<String> {
        self.state.lock().map(|s| s.started.clone()).unwrap_or_default()
    }

    pub fn max_parallel(&self) -> usize {
        self.state.lock().map(|s| s.max_parallel).unwrap_or(0)
    }

    /// Calls still marked as running
    pub fn running(&self) -> usize {
        self.state.lock().map(|s| s.running.len()).unwrap_or(0)
    }
}

struct ProbeGuard {
    probe: Option<Arc<ConcurrencyProbe>>,
    label: String,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(probe) = &self.probe {
            probe.exit(&self.label);
        }
    }
}

/// Tool whose behaviour is driven by its input
pub struct ScriptedTool {
    name: String,
    safe: bool,
    probe: Option<Arc<ConcurrencyProbe>>,
    reply: Option<String>,
    schema: Option<Value>,
}

impl ScriptedTool {
    pub fn new(name: &str, safe: bool) -> Self {
        Self {
            name: name.to_string(),
            safe,
            probe: None,
            reply: None,
            schema: None,
        }
    }

    /// Content returned when the input does not say otherwise
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Input schema to advertise instead of any object
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test tool"
    }

    fn input_schema(&self) -> Value {
        self.schema.clone().unwrap_or_else(|| json!({"type": "object"}))
    }

    fn is_concurrency_safe(&self, _input: &Value) -> bool {
        self.safe
    }

    async fn call(
        &self,
        input: Value,
        ctx: &ToolContext,
        progress: &ProgressSink,
    ) -> Result<ToolOutput> {
        let label = input
            .get("label")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| ctx.tool_use_id.clone());
        if let Some(probe) = &self.probe {
            probe.enter(&label, self.safe);
        }
        let _guard = ProbeGuard {
            probe: self.probe.clone(),
            label: label.clone(),
        };

        if let Some(lines) = input.get("progress").and_then(Value::as_array) {
            for line in lines.iter().filter_map(Value::as_str) {
                progress.send(line);
            }
        }

        if input.get("hang").and_then(Value::as_bool).unwrap_or(false) {
            ctx.abort.cancelled().await;
            return Err(Error::Cancelled);
        }

        let delay = input.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
        if delay > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = ctx.abort.cancelled() => return Err(Error::Cancelled),
            }
        }

        let content = input
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.reply.clone())
            .unwrap_or_else(|| format!("{} done", label));

        let mut output = if input.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            ToolOutput::error(content)
        } else {
            ToolOutput::success(content)
        };
        if let Some(cwd) = input.get("cwd").and_then(Value::as_str) {
            output = output.with_patch(ContextPatch::SetCwd(PathBuf::from(cwd)));
        }
        Ok(output)
    }
}
