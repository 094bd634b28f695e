//! Turn loop
//!
//! Drives one user turn as an explicit state machine:
//!
//! ```text
//! Init → ModelCall ─┬─ tool calls ──────→ ToolExecution → Recurse → ModelCall
//!                   ├─ obligation owed ─→ (synthesize calls) ToolExecution
//!                   └─ nothing owed ────→ StopHook ─┬─ continue → ModelCall
//!                                                   └─ Done
//! ```
//!
//! Model-call failures end the turn with a visible message; this layer never
//! retries. Stage tools do their own retrying through the retry harness.

mod state;

pub use state::{TurnOutcome, TurnStop, API_ERROR_PREFIX, INTERRUPT_MESSAGE, NO_CONTENT_MESSAGE};

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{FailoverSlot, ModelRequest};
use crate::budget::AbortScope;
use crate::config::{Config, GateConfig, TurnConfig};
use crate::evidence::{synthesize_tool_uses, EvidenceSnapshot, Obligation};
use crate::hooks::StopDecision;
use crate::queue::ToolExecutionQueue;
use crate::session::SessionContext;
use crate::tools::{ToolRunner, ToolUseContext};
use crate::transcript::{AssistantMessage, Message, StopReason, Transcript};
use crate::{Error, Result};
use state::TurnState;

const SYSTEM_PROMPT: &str = include_str!("../../prompts/system.md");

/// Per-turn counters
#[derive(Debug, Default)]
struct TurnCounters {
    model_calls: u32,
    synthesized_calls: u32,
    stop_continuations: u32,
    attempts: HashMap<Obligation, u32>,
}

/// Runs turns for one session
pub struct TurnLoop {
    slot: Arc<FailoverSlot>,
    runner: Arc<ToolRunner>,
    session: Arc<SessionContext>,
    gate: GateConfig,
    turn: TurnConfig,
    system_prompt: String,
    max_tokens: Option<u32>,
    context: ToolUseContext,
    observer: Option<mpsc::UnboundedSender<Message>>,
}

impl TurnLoop {
    pub fn new(
        slot: Arc<FailoverSlot>,
        runner: Arc<ToolRunner>,
        session: Arc<SessionContext>,
        config: &Config,
    ) -> Self {
        Self {
            slot,
            runner,
            session,
            gate: config.gate.clone(),
            turn: config.turn.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            max_tokens: Some(config.backend.max_tokens),
            context: ToolUseContext::default(),
            observer: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_context(mut self, context: ToolUseContext) -> Self {
        self.context = context;
        self
    }

    /// Receive every message as it is produced, progress included
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<Message>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Tool context as left by the last turn
    pub fn context(&self) -> &ToolUseContext {
        &self.context
    }

    /// Run one turn for `prompt`, appending everything to `transcript`
    pub async fn run_turn(
        &mut self,
        transcript: &mut Transcript,
        prompt: &str,
        abort: &AbortScope,
    ) -> TurnOutcome {
        let mut counters = TurnCounters::default();
        let mut state = TurnState::Init;

        let stop = loop {
            debug!("Turn state: {}", state.label());
            state = match state {
                TurnState::Init => {
                    self.record(transcript, Message::user_text(prompt));
                    TurnState::ModelCall
                }
                TurnState::ModelCall => self.model_call(transcript, abort, &mut counters).await,
                TurnState::StopHook(message) => {
                    self.stop_hook(transcript, message, &mut counters).await
                }
                TurnState::ToolExecution(message) => {
                    self.execute_tools(transcript, message, abort).await
                }
                TurnState::Recurse => {
                    if abort.is_aborted() {
                        self.interrupt(transcript)
                    } else {
                        TurnState::ModelCall
                    }
                }
                TurnState::Done(stop) => break stop,
            };
        };

        let final_text = transcript
            .messages
            .iter()
            .rev()
            .find_map(Message::as_assistant)
            .map(AssistantMessage::joined_text)
            .unwrap_or_default();
        info!(
            "Turn {} after {} model calls ({} synthesized tool calls)",
            stop, counters.model_calls, counters.synthesized_calls
        );

        TurnOutcome {
            stop,
            final_text,
            model_calls: counters.model_calls,
            synthesized_calls: counters.synthesized_calls,
            stop_continuations: counters.stop_continuations,
        }
    }

    async fn model_call(
        &self,
        transcript: &mut Transcript,
        abort: &AbortScope,
        counters: &mut TurnCounters,
    ) -> TurnState {
        if abort.is_aborted() {
            return self.interrupt(transcript);
        }
        if counters.model_calls >= self.turn.max_depth {
            warn!("Turn reached {} model calls", self.turn.max_depth);
            let text = format!(
                "Stopped after {} model calls without reaching a final answer.",
                counters.model_calls
            );
            self.record(
                transcript,
                Message::Assistant(AssistantMessage::text(text, StopReason::Error)),
            );
            return TurnState::Done(TurnStop::DepthExceeded);
        }
        counters.model_calls += 1;

        let mut request = ModelRequest::new(self.system_prompt.clone(), transcript.persisted())
            .with_tools(self.runner.registry().schemas());
        request.max_tokens = self.max_tokens;

        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(Error::Cancelled),
            result = self.sample(&request, abort) => result,
        };

        let mut message = match result {
            Ok(message) => message,
            Err(e) if e.is_cancelled() || abort.is_aborted() => return self.interrupt(transcript),
            Err(e) => {
                warn!("Model call failed: {}", e);
                let mut message = AssistantMessage::text(
                    format!("{}: {}", API_ERROR_PREFIX, e),
                    StopReason::Error,
                );
                message.is_api_error = true;
                self.record(transcript, Message::Assistant(message));
                return TurnState::Done(TurnStop::ApiError);
            }
        };

        if message.has_tool_uses() {
            return TurnState::ToolExecution(message);
        }

        let snapshot = EvidenceSnapshot::project(&transcript.messages);
        let Some(obligation) = snapshot.next_obligation() else {
            if message.is_empty() {
                message.text = vec![NO_CONTENT_MESSAGE.to_string()];
            }
            return TurnState::StopHook(message);
        };

        let attempts = counters.attempts.entry(obligation).or_insert(0);
        if *attempts >= obligation.ceiling(&self.gate) {
            info!("Hard-blocking on {} after {} attempts", obligation, attempts);
            let text = snapshot
                .hard_block_message(*attempts)
                .unwrap_or_else(|| format!("Obligation {} is still unmet.", obligation));
            let mut block = AssistantMessage::text(text, StopReason::EndTurn);
            block.stop.model = message.stop.model.clone();
            block.stop.hard_block = Some(obligation);
            self.record(transcript, Message::Assistant(block));
            return TurnState::Done(TurnStop::HardBlocked(obligation));
        }
        *attempts += 1;
        let attempt = *attempts;

        if self.session.mark_started("evidence_gate") {
            info!("Evidence gate engaged for session {}", self.session.id);
        }
        let calls = synthesize_tool_uses(&snapshot);
        info!(
            "Synthesizing {} for {} (attempt {} of {})",
            obligation.tool_name(),
            obligation,
            attempt,
            obligation.ceiling(&self.gate)
        );
        let narration = match obligation {
            Obligation::AutorepairFailedCriticalTests => format!(
                "Auto-repairing failed critical tests (attempt {} of {})",
                attempt,
                obligation.ceiling(&self.gate)
            ),
            _ => snapshot
                .instruction()
                .unwrap_or_else(|| format!("Running {}", obligation.tool_name())),
        };
        self.emit(&Message::progress(None, narration));

        counters.synthesized_calls += calls.len() as u32;
        message.tool_uses.extend(calls);
        message.stop.reason = StopReason::ToolUse;
        message.stop.synthesized = true;
        TurnState::ToolExecution(message)
    }

    /// One model call, or two raced when dual sampling is on
    async fn sample(&self, request: &ModelRequest, abort: &AbortScope) -> Result<AssistantMessage> {
        let backend = self.slot.current();
        if !self.turn.dual_sampling {
            let mut message = backend.complete(request, abort).await?;
            message.stop.model.get_or_insert_with(|| backend.model().to_string());
            return Ok(message);
        }

        let mut calls: FuturesUnordered<_> =
            (0..2).map(|_| backend.complete(request, abort)).collect();
        let mut fallback: Option<AssistantMessage> = None;
        let mut last_error = None;
        while let Some(result) = calls.next().await {
            match result {
                Ok(message) if !message.is_empty() && !message.is_api_error => {
                    return Ok(message);
                }
                Ok(message) => {
                    debug!("Discarding empty sample");
                    fallback.get_or_insert(message);
                }
                Err(e) => {
                    debug!("Sample failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        match (fallback, last_error) {
            (Some(message), _) => Ok(message),
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::Config("dual sampling produced nothing".to_string())),
        }
    }

    async fn stop_hook(
        &self,
        transcript: &mut Transcript,
        message: AssistantMessage,
        counters: &mut TurnCounters,
    ) -> TurnState {
        let decision = self.runner.hooks().on_stop(&message, &self.session).await;
        self.record(transcript, Message::Assistant(message));

        match decision {
            Ok(StopDecision::Continue { reason })
                if counters.stop_continuations < self.turn.max_stop_continuations =>
            {
                counters.stop_continuations += 1;
                info!(
                    "Stop hook requested continuation {}: {}",
                    counters.stop_continuations, reason
                );
                self.record(
                    transcript,
                    Message::user_meta(format!("Stop hook feedback: {}", reason)),
                );
                TurnState::ModelCall
            }
            Ok(StopDecision::Continue { .. }) => {
                warn!(
                    "Stop hook continuation limit ({}) reached",
                    self.turn.max_stop_continuations
                );
                TurnState::Done(TurnStop::Completed)
            }
            Ok(StopDecision::Allow) => TurnState::Done(TurnStop::Completed),
            Err(e) => {
                warn!("Stop hook failed: {}", e);
                TurnState::Done(TurnStop::Completed)
            }
        }
    }

    async fn execute_tools(
        &mut self,
        transcript: &mut Transcript,
        message: AssistantMessage,
        abort: &AbortScope,
    ) -> TurnState {
        let mut queue = ToolExecutionQueue::new(
            self.runner.clone(),
            self.context.clone(),
            self.session.clone(),
            abort.clone(),
        );
        for tool_use in message.tool_uses.clone() {
            queue.add_tool(tool_use, &message);
        }
        self.record(transcript, Message::Assistant(message));

        while let Some(result) = queue.next_message().await {
            if result.is_progress() {
                self.emit(&result);
            } else {
                self.record(transcript, result);
            }
        }
        self.context = queue.into_context();
        TurnState::Recurse
    }

    fn interrupt(&self, transcript: &mut Transcript) -> TurnState {
        info!("Turn interrupted");
        self.record(
            transcript,
            Message::Assistant(AssistantMessage::text(
                INTERRUPT_MESSAGE,
                StopReason::Interrupted,
            )),
        );
        TurnState::Done(TurnStop::Interrupted)
    }

    fn record(&self, transcript: &mut Transcript, message: Message) {
        self.emit(&message);
        transcript.push(message);
    }

    fn emit(&self, message: &Message) {
        if let Some(observer) = &self.observer {
            // A closed observer only means nobody is rendering
            let _ = observer.send(message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendErrorKind, ScriptStep, ScriptedBackend};
    use crate::budget::AbortCause;
    use crate::hooks::Hooks;
    use crate::evidence::ASK_USER_TOOL;
    use crate::tools::{AskUserTool, NoPrompter, ScriptedTool, ToolRegistry};
    use crate::transcript::{SyntheticReason, ToolUse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct AlwaysContinue;

    #[async_trait]
    impl Hooks for AlwaysContinue {
        async fn on_stop(
            &self,
            _message: &AssistantMessage,
            _session: &SessionContext,
        ) -> Result<StopDecision> {
            Ok(StopDecision::Continue {
                reason: "check the tests".to_string(),
            })
        }
    }

    struct Harness {
        backend: Arc<ScriptedBackend>,
        turn: TurnLoop,
    }

    fn harness(steps: Vec<ScriptStep>, experiment_reply: &str, config: Config) -> Harness {
        harness_with(steps, experiment_reply, config, None)
    }

    fn harness_with(
        steps: Vec<ScriptStep>,
        experiment_reply: &str,
        config: Config,
        hooks: Option<Arc<dyn Hooks>>,
    ) -> Harness {
        let backend = Arc::new(ScriptedBackend::new(steps));
        let slot = Arc::new(FailoverSlot::new(backend.clone()));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool::new("Echo", true)));
        registry.register(Arc::new(ScriptedTool::new("FalsificationPlan", false)));
        registry.register(Arc::new(
            ScriptedTool::new("ExperimentRunners", false).with_reply(experiment_reply),
        ));
        registry.register(Arc::new(AskUserTool::new(Arc::new(NoPrompter))));
        let mut runner = ToolRunner::new(Arc::new(registry));
        if let Some(hooks) = hooks {
            runner = runner.with_hooks(hooks);
        }

        let session = Arc::new(SessionContext::new("s1", "ana", "popper", Duration::from_secs(60)));
        let turn = TurnLoop::new(slot, Arc::new(runner), session, &config);
        Harness { backend, turn }
    }

    fn plan_call() -> ToolUse {
        ToolUse::new(
            "FalsificationPlan",
            json!({"hypothesis": "h", "content": r#"{"status":"ready"}"#}),
        )
    }

    fn assistants(transcript: &Transcript) -> Vec<&AssistantMessage> {
        transcript.messages.iter().filter_map(Message::as_assistant).collect()
    }

    #[tokio::test]
    async fn test_plain_answer_completes() {
        let mut h = harness(vec![ScriptStep::text("Hello")], "{}", Config::default());
        let mut transcript = Transcript::new();
        let outcome = h.turn.run_turn(&mut transcript, "hi", &AbortScope::new()).await;

        assert_eq!(outcome.stop, TurnStop::Completed);
        assert_eq!(outcome.final_text, "Hello");
        assert_eq!(transcript.messages.len(), 2);
        assert_eq!(transcript.title.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_tool_results_follow_their_request() {
        let echo = ToolUse::new("Echo", json!({"content": "pong"}));
        let mut h = harness(
            vec![ScriptStep::tools("", vec![echo.clone()]), ScriptStep::text("done")],
            "{}",
            Config::default(),
        );
        let mut transcript = Transcript::new();
        let outcome = h.turn.run_turn(&mut transcript, "ping", &AbortScope::new()).await;

        assert_eq!(outcome.model_calls, 2);
        let result = transcript.messages[2].tool_results().next().unwrap();
        assert_eq!(result.tool_use_id, echo.id);
        assert_eq!(result.content, "pong");
        assert_eq!(h.backend.requests()[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_gate_synthesizes_missing_experiment_run() {
        let mut h = harness(
            vec![
                ScriptStep::tools("", vec![plan_call()]),
                ScriptStep::text("It's true."),
                ScriptStep::text("Rejected early; the toy check failed."),
            ],
            r#"{"decision":"REJECT_EARLY","toy_truth":"FAIL"}"#,
            Config::default(),
        );
        let mut transcript = Transcript::new();
        let outcome = h
            .turn
            .run_turn(&mut transcript, "test my hypothesis", &AbortScope::new())
            .await;

        assert_eq!(outcome.stop, TurnStop::Completed);
        assert_eq!(outcome.synthesized_calls, 1);
        assert_eq!(outcome.final_text, "Rejected early; the toy check failed.");

        let premature = assistants(&transcript)
            .into_iter()
            .find(|a| a.joined_text() == "It's true.")
            .unwrap();
        assert!(premature.stop.synthesized);
        assert_eq!(premature.tool_uses[0].name, "ExperimentRunners");
        assert_eq!(premature.tool_uses[0].input["hypothesis"], "test my hypothesis");
    }

    #[tokio::test]
    async fn test_unmet_obligation_hard_blocks_at_ceiling() {
        let mut config = Config::default();
        config.gate.hard_ceiling = 1;
        let mut h = harness(
            vec![
                ScriptStep::tools("", vec![plan_call()]),
                ScriptStep::text("done"),
                ScriptStep::text("done"),
                ScriptStep::text("done"),
            ],
            r#"{"decision":"DEFINITIVE_FAIL","failed_tests":["t1"]}"#,
            config,
        );
        let mut transcript = Transcript::new();
        let outcome = h.turn.run_turn(&mut transcript, "test it", &AbortScope::new()).await;

        assert_eq!(
            outcome.stop,
            TurnStop::HardBlocked(Obligation::AutorepairFailedCriticalTests)
        );
        assert!(outcome.final_text.contains("autorepair_failed_critical_tests"));
        assert!(outcome.final_text.contains("Latest experiment decision: DEFINITIVE_FAIL"));
        assert!(!assistants(&transcript)
            .iter()
            .any(|a| a.joined_text() == "done" && a.tool_uses.is_empty()));
        let last = assistants(&transcript).pop().unwrap().clone();
        assert_eq!(last.stop.hard_block, Some(Obligation::AutorepairFailedCriticalTests));
    }

    #[tokio::test]
    async fn test_dataset_question_blocks_at_soft_ceiling() {
        let config = Config::default();
        assert!(config.gate.soft_ceiling < config.gate.hard_ceiling);
        let soft = config.gate.soft_ceiling as usize;

        let mut steps = vec![ScriptStep::tools("", vec![plan_call()])];
        // One stop for the experiment run, one per question, one to block
        steps.extend((0..soft + 2).map(|_| ScriptStep::text("done")));
        let mut h = harness(steps, r#"{"decision":"NEEDS_FIELD"}"#, config);
        let mut transcript = Transcript::new();
        let outcome = h.turn.run_turn(&mut transcript, "test it", &AbortScope::new()).await;

        assert_eq!(outcome.stop, TurnStop::HardBlocked(Obligation::AskDatasetDecision));
        assert_eq!(h.backend.remaining(), 0);

        let questions = assistants(&transcript)
            .iter()
            .filter(|a| a.stop.synthesized)
            .flat_map(|a| a.tool_uses.iter())
            .filter(|t| t.name == ASK_USER_TOOL)
            .count();
        assert_eq!(questions, soft);
        assert_eq!(outcome.synthesized_calls as usize, soft + 1);
        let unanswered = transcript
            .messages
            .iter()
            .flat_map(|m| m.tool_results())
            .filter(|b| b.is_error)
            .count();
        assert_eq!(unanswered, soft);
    }

    #[tokio::test]
    async fn test_autorepair_is_narrated() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = Config::default();
        config.gate.hard_ceiling = 1;
        let h = harness(
            vec![
                ScriptStep::tools("", vec![plan_call()]),
                ScriptStep::text("a"),
                ScriptStep::text("b"),
                ScriptStep::text("c"),
            ],
            r#"{"decision":"DEFINITIVE_FAIL"}"#,
            config,
        );
        let mut turn = h.turn.with_observer(tx);
        turn.run_turn(&mut Transcript::new(), "test it", &AbortScope::new())
            .await;

        let mut narrated = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Progress(p) = message {
                narrated.push(p.text);
            }
        }
        assert!(narrated.iter().any(|t| t.starts_with("Auto-repairing failed critical tests")));
    }

    #[tokio::test]
    async fn test_api_error_is_visible() {
        let mut h = harness(
            vec![ScriptStep::fail(BackendErrorKind::Auth, "invalid key")],
            "{}",
            Config::default(),
        );
        let mut transcript = Transcript::new();
        let outcome = h.turn.run_turn(&mut transcript, "hi", &AbortScope::new()).await;

        assert_eq!(outcome.stop, TurnStop::ApiError);
        assert!(outcome.final_text.starts_with("API Error"));
        assert!(assistants(&transcript)[0].is_api_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_call_gives_interrupt_message() {
        let mut h = harness(vec![ScriptStep::hang()], "{}", Config::default());
        let abort = AbortScope::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.abort(AbortCause::UserInterrupt);
        });

        let mut transcript = Transcript::new();
        let outcome = h.turn.run_turn(&mut transcript, "hi", &abort).await;
        assert_eq!(outcome.stop, TurnStop::Interrupted);
        assert_eq!(outcome.final_text, INTERRUPT_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_tools_interrupts_results_and_turn() {
        let hang = ToolUse::new("Echo", json!({"hang": true}));
        let mut h = harness(vec![ScriptStep::tools("", vec![hang])], "{}", Config::default());
        let abort = AbortScope::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.abort(AbortCause::UserInterrupt);
        });

        let mut transcript = Transcript::new();
        let outcome = h.turn.run_turn(&mut transcript, "hi", &abort).await;
        assert_eq!(outcome.stop, TurnStop::Interrupted);
        let result = transcript.messages[2].tool_results().next().unwrap();
        assert_eq!(result.synthetic, Some(SyntheticReason::UserInterrupted));
    }

    #[tokio::test]
    async fn test_empty_answer_gets_fallback() {
        let mut h = harness(vec![ScriptStep::empty()], "{}", Config::default());
        let outcome = h
            .turn
            .run_turn(&mut Transcript::new(), "hi", &AbortScope::new())
            .await;
        assert_eq!(outcome.final_text, NO_CONTENT_MESSAGE);
    }

    #[tokio::test]
    async fn test_stop_hook_continuations_are_bounded() {
        let mut config = Config::default();
        config.turn.max_stop_continuations = 2;
        let mut h = harness_with(
            vec![ScriptStep::text("a"), ScriptStep::text("b"), ScriptStep::text("c")],
            "{}",
            config,
            Some(Arc::new(AlwaysContinue)),
        );
        let outcome = h
            .turn
            .run_turn(&mut Transcript::new(), "hi", &AbortScope::new())
            .await;
        assert_eq!(outcome.stop, TurnStop::Completed);
        assert_eq!(outcome.stop_continuations, 2);
        assert_eq!(h.backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_depth_limit_stops_runaway_tool_loop() {
        let mut config = Config::default();
        config.turn.max_depth = 2;
        let step = || ScriptStep::tools("", vec![ToolUse::new("Echo", json!({}))]);
        let mut h = harness(vec![step(), step(), step()], "{}", config);
        let outcome = h
            .turn
            .run_turn(&mut Transcript::new(), "loop", &AbortScope::new())
            .await;
        assert_eq!(outcome.stop, TurnStop::DepthExceeded);
        assert_eq!(h.backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_dual_sampling_keeps_the_usable_sample() {
        let mut config = Config::default();
        config.turn.dual_sampling = true;
        let mut h = harness(
            vec![
                ScriptStep::fail(BackendErrorKind::Overloaded, "busy"),
                ScriptStep::text("ok"),
            ],
            "{}",
            config,
        );
        let outcome = h
            .turn
            .run_turn(&mut Transcript::new(), "hi", &AbortScope::new())
            .await;
        assert_eq!(outcome.stop, TurnStop::Completed);
        assert_eq!(outcome.final_text, "ok");
    }

    #[tokio::test]
    async fn test_tool_context_carries_across_turns() {
        let cd = ToolUse::new("Echo", json!({"cwd": "/work"}));
        let mut h = harness(
            vec![ScriptStep::tools("", vec![cd]), ScriptStep::text("moved")],
            "{}",
            Config::default(),
        );
        h.turn
            .run_turn(&mut Transcript::new(), "cd", &AbortScope::new())
            .await;
        assert_eq!(h.turn.context().cwd, std::path::PathBuf::from("/work"));
    }
}
