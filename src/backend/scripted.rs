//! Scripted backend for tests
//!
//! Replies are popped from a fixed script in order. Each step may be
//! delayed or may hang until its abort scope fires.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{aborted, BackendErrorKind, ModelBackend, ModelRequest};
use crate::budget::{sleep_or_abort, AbortScope};
use crate::transcript::{AssistantMessage, StopReason, ToolUse};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum StepOutcome {
    Reply(AssistantMessage),
    Fail(BackendErrorKind, String),
    Hang,
}

/// One scripted reply
#[derive(Debug, Clone)]
pub struct ScriptStep {
    delay: Duration,
    outcome: StepOutcome,
}

impl ScriptStep {
    /// Plain text answer
    pub fn text(text: impl Into<String>) -> Self {
        Self::reply(AssistantMessage::text(text, StopReason::EndTurn))
    }

    /// Text followed by tool calls
    pub fn tools(text: impl Into<String>, tool_uses: Vec<ToolUse>) -> Self {
        let text = text.into();
        let text = if text.is_empty() { Vec::new() } else { vec![text] };
        Self::reply(AssistantMessage::new(text, tool_uses, StopReason::ToolUse))
    }

    /// A JSON document as the text reply
    pub fn json(value: Value) -> Self {
        Self::text(value.to_string())
    }

    /// An empty reply
    pub fn empty() -> Self {
        Self::reply(AssistantMessage::new(Vec::new(), Vec::new(), StopReason::EndTurn))
    }

    pub fn reply(message: AssistantMessage) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: StepOutcome::Reply(message),
        }
    }

    pub fn fail(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: StepOutcome::Fail(kind, message.into()),
        }
    }

    /// Never answer; resolves only when aborted
    pub fn hang() -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: StepOutcome::Hang,
        }
    }

    /// Delay this step
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Backend replaying a fixed script
pub struct ScriptedBackend {
    name: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::named("scripted", steps)
    }

    pub fn named(name: &str, steps: Vec<ScriptStep>) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of calls made so far
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Steps not yet consumed
    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: &ModelRequest,
        abort: &AbortScope,
    ) -> Result<AssistantMessage> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let step = self
            .steps
            .lock()
            .ok()
            .and_then(|mut steps| steps.pop_front())
            .ok_or_else(|| {
                Error::backend(BackendErrorKind::InvalidRequest, "script exhausted")
            })?;

        if !step.delay.is_zero() {
            sleep_or_abort(step.delay, abort)
                .await
                .map_err(|cause| Error::from_abort(&cause))?;
        }
        if abort.is_aborted() {
            return Err(aborted(abort));
        }

        match step.outcome {
            StepOutcome::Reply(mut message) => {
                message.stop.model = Some(self.name.clone());
                Ok(message)
            }
            StepOutcome::Fail(kind, message) => Err(Error::backend(kind, message)),
            StepOutcome::Hang => {
                abort.cancelled().await;
                Err(aborted(abort))
            }
        }
    }
}
