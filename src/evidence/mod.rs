//! Evidence gate
//!
//! Projects the current turn's transcript onto the hypothesis pipeline and
//! reports which obligation, if any, is still owed before the model may
//! give a final answer. The projection is a pure function of the messages:
//! - Only messages since the last user prompt are considered
//! - Progress messages are ignored
//! - For each stage the latest record wins, an errored record included

mod obligations;
mod types;

pub use obligations::{synthesize_tool_uses, Obligation, ASK_USER_TOOL};
pub use types::{
    BaconianEvidence, CriticalTest, DatasetAction, DatasetDecision, DecisionTopic,
    DialecticalEvidence, Evidence, ExperimentEvidence, FalsificationEvidence,
    NormalizationEvidence, PlanStatus, StageDecision, StageKind, ToyTruth, UserDecision,
};

use std::collections::BTreeSet;

use crate::transcript::Message;

/// What the current turn has established about the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceSnapshot {
    /// A pipeline tool was requested or answered this turn
    pub pipeline_active: bool,
    /// Stages whose latest record carries evidence
    pub stages_ready: BTreeSet<StageKind>,
    /// Status of the latest falsification plan, if it produced one
    pub plan_status: Option<PlanStatus>,
    /// Latest experiment run, `None` if it never ran or its latest record errored
    pub experiment: Option<ExperimentEvidence>,
    /// Structured answers from the user this turn
    pub user_decisions: Vec<UserDecision>,
    /// Normalized hypothesis, if normalization ran
    pub hypothesis: Option<String>,
    /// Text of the prompt that opened the turn
    pub prompt: Option<String>,
    /// Pending obligations, at most one
    pub obligations: Vec<Obligation>,
}

impl EvidenceSnapshot {
    /// Project the current turn of `messages`
    pub fn project(messages: &[Message]) -> Self {
        let start = turn_start(messages);
        let window = &messages[start..];

        let mut snapshot = EvidenceSnapshot {
            pipeline_active: false,
            stages_ready: BTreeSet::new(),
            plan_status: None,
            experiment: None,
            user_decisions: Vec::new(),
            hypothesis: None,
            prompt: messages
                .get(start)
                .and_then(Message::as_user)
                .filter(|u| u.is_prompt())
                .map(|u| u.text()),
            obligations: Vec::new(),
        };

        for message in window {
            match message {
                Message::Progress(_) => {}
                Message::Assistant(assistant) => {
                    if assistant
                        .tool_uses
                        .iter()
                        .any(|t| StageKind::from_tool_name(&t.name).is_some())
                    {
                        snapshot.pipeline_active = true;
                    }
                }
                Message::User(_) => {
                    for block in message.tool_results() {
                        snapshot.absorb(&block.tool_name, block.evidence.as_ref());
                    }
                }
            }
        }

        snapshot.obligations = derive_obligations(&snapshot);
        snapshot
    }

    fn absorb(&mut self, tool_name: &str, evidence: Option<&Evidence>) {
        if let Some(Evidence::UserDecision(decision)) = evidence {
            self.user_decisions.push(decision.clone());
            return;
        }

        let Some(stage) = StageKind::from_tool_name(tool_name) else {
            return;
        };
        self.pipeline_active = true;

        // A record without evidence (error, interrupt) supersedes the stage
        let evidence = evidence.filter(|e| e.stage() == Some(stage));
        if evidence.is_some() {
            self.stages_ready.insert(stage);
        } else {
            self.stages_ready.remove(&stage);
        }

        match (stage, evidence) {
            (StageKind::Falsification, Some(Evidence::FalsificationPlan(plan))) => {
                self.plan_status = Some(plan.status);
            }
            (StageKind::Falsification, _) => self.plan_status = None,
            (StageKind::ExperimentRunners, Some(Evidence::ExperimentRun(run))) => {
                self.experiment = Some(run.clone());
            }
            (StageKind::ExperimentRunners, _) => self.experiment = None,
            (StageKind::Normalization, Some(Evidence::Normalization(norm))) => {
                self.hypothesis = Some(norm.hypothesis.clone());
            }
            _ => {}
        }
    }

    pub fn plan_ready(&self) -> bool {
        self.plan_status == Some(PlanStatus::Ready)
    }

    pub fn experiment_completed(&self) -> bool {
        self.experiment.is_some()
    }

    pub fn last_decision(&self) -> Option<StageDecision> {
        self.experiment.as_ref().map(|e| e.decision)
    }

    pub fn toy_truth(&self) -> Option<ToyTruth> {
        self.experiment.as_ref().and_then(|e| e.toy_truth)
    }

    pub fn dataset(&self) -> Option<&DatasetDecision> {
        self.experiment.as_ref().map(|e| &e.dataset)
    }

    /// First pending obligation
    pub fn next_obligation(&self) -> Option<Obligation> {
        self.obligations.first().copied()
    }

    /// Hypothesis to hand to synthesized stage calls
    pub fn hypothesis_text(&self) -> String {
        self.hypothesis
            .clone()
            .or_else(|| self.prompt.clone())
            .unwrap_or_default()
    }

    /// Instruction telling the model what it still owes
    pub fn instruction(&self) -> Option<String> {
        self.next_obligation().map(|o| o.instruction(self))
    }

    /// Text shown when the obligation could not be met within its ceiling
    pub fn hard_block_message(&self, attempts: u32) -> Option<String> {
        let obligation = self.next_obligation()?;
        let mut out = format!(
            "I can't give a final answer yet: the `{}` obligation is still unmet after {} attempt{}.\n\n{}",
            obligation.id(),
            attempts,
            if attempts == 1 { "" } else { "s" },
            obligation.instruction(self),
        );
        if let Some(decision) = self.last_decision() {
            out.push_str(&format!("\n\nLatest experiment decision: {}", decision));
            if let Some(summary) = self.experiment.as_ref().and_then(|e| e.summary.as_ref()) {
                out.push_str(&format!(" ({})", summary));
            }
        }
        Some(out)
    }
}

/// Index of the last user prompt, or 0
fn turn_start(messages: &[Message]) -> usize {
    messages
        .iter()
        .rposition(|m| m.as_user().map(|u| u.is_prompt()).unwrap_or(false))
        .unwrap_or(0)
}

/// Short-circuiting obligation checks
fn derive_obligations(s: &EvidenceSnapshot) -> Vec<Obligation> {
    if !s.pipeline_active {
        return Vec::new();
    }
    if !s.plan_ready() {
        return vec![Obligation::RunFalsificationPlan];
    }
    let Some(run) = &s.experiment else {
        return vec![Obligation::RunExperimentRunners];
    };

    let toy_failed = run.toy_truth == Some(ToyTruth::Fail);
    match run.decision {
        StageDecision::RejectEarly if !toy_failed => {
            return vec![Obligation::AutorepairFailedCriticalTests];
        }
        StageDecision::DefinitiveFail => {
            return vec![Obligation::AutorepairFailedCriticalTests];
        }
        _ => {}
    }

    let stopped = s.user_decisions.iter().any(UserDecision::is_stop);
    if run.decision == StageDecision::NeedsField
        && !run.dataset.has_real_data()
        && !s.user_decisions.iter().any(UserDecision::resolves_dataset)
    {
        return vec![Obligation::AskDatasetDecision];
    }
    if matches!(
        run.decision,
        StageDecision::ProvisionalPass | StageDecision::NeedsField
    ) && !stopped
        && !s.user_decisions.iter().any(UserDecision::accepts_provisional)
    {
        return vec![Obligation::CollectFieldEvidence];
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{AssistantMessage, StopReason, ToolResultBlock, ToolUse};
    use serde_json::{json, Value};

    fn stage_call(name: &str, output: Value) -> Vec<Message> {
        let tool_use = ToolUse::new(name, json!({"hypothesis": "h"}));
        let mut block = ToolResultBlock::success(&tool_use, output.to_string());
        block.evidence = Evidence::ingest(name, &output.to_string());
        vec![
            Message::Assistant(AssistantMessage::new(
                vec![],
                vec![tool_use],
                StopReason::ToolUse,
            )),
            Message::tool_result(block),
        ]
    }

    fn stage_error(name: &str) -> Vec<Message> {
        let tool_use = ToolUse::new(name, json!({"hypothesis": "h"}));
        vec![
            Message::Assistant(AssistantMessage::new(
                vec![],
                vec![tool_use.clone()],
                StopReason::ToolUse,
            )),
            Message::tool_result(ToolResultBlock::error(&tool_use, "backend down")),
        ]
    }

    fn decision(topic: DecisionTopic, choice: &str) -> Vec<Message> {
        let tool_use = ToolUse::new("AskUserQuestion", json!({}));
        let mut block = ToolResultBlock::success(&tool_use, choice);
        block.evidence = Some(Evidence::UserDecision(UserDecision {
            topic,
            choice: choice.to_string(),
        }));
        vec![Message::tool_result(block)]
    }

    fn turn(parts: Vec<Vec<Message>>) -> Vec<Message> {
        let mut messages = vec![Message::user_text("Test whether caffeine improves recall")];
        for part in parts {
            messages.extend(part);
        }
        messages
    }

    fn plan_ready() -> Vec<Message> {
        stage_call("FalsificationPlan", json!({"status": "ready"}))
    }

    fn run(decision: &str, toy: Option<&str>) -> Vec<Message> {
        let mut output = json!({"decision": decision});
        if let Some(toy) = toy {
            output["toy_truth"] = json!(toy);
        }
        stage_call("ExperimentRunners", output)
    }

    #[test]
    fn test_no_pipeline_no_obligation() {
        let messages = vec![
            Message::user_text("what time is it"),
            Message::assistant_text("noon", StopReason::EndTurn),
        ];
        let snapshot = EvidenceSnapshot::project(&messages);
        assert!(!snapshot.pipeline_active);
        assert!(snapshot.obligations.is_empty());
        assert!(snapshot.instruction().is_none());
    }

    #[test]
    fn test_pipeline_without_plan_requires_plan() {
        let messages = turn(vec![stage_call(
            "Normalization",
            json!({"hypothesis": "caffeine improves recall"}),
        )]);
        let snapshot = EvidenceSnapshot::project(&messages);
        assert_eq!(snapshot.obligations, vec![Obligation::RunFalsificationPlan]);
        assert_eq!(snapshot.hypothesis_text(), "caffeine improves recall");
    }

    #[test]
    fn test_ready_plan_without_run_requires_experiment_runners() {
        let snapshot = EvidenceSnapshot::project(&turn(vec![plan_ready()]));
        assert_eq!(snapshot.obligations, vec![Obligation::RunExperimentRunners]);
        let instruction = snapshot.instruction().unwrap();
        assert!(instruction.contains("ExperimentRunners"));
    }

    #[test]
    fn test_reject_early_with_toy_fail_is_terminal() {
        let snapshot =
            EvidenceSnapshot::project(&turn(vec![plan_ready(), run("REJECT_EARLY", Some("FAIL"))]));
        assert!(snapshot.obligations.is_empty());
        assert!(snapshot.hard_block_message(3).is_none());
    }

    #[test]
    fn test_reject_early_without_toy_fail_requires_repair() {
        let snapshot =
            EvidenceSnapshot::project(&turn(vec![plan_ready(), run("REJECT_EARLY", Some("PASS"))]));
        assert_eq!(
            snapshot.obligations,
            vec![Obligation::AutorepairFailedCriticalTests]
        );
    }

    #[test]
    fn test_definitive_fail_requires_repair() {
        let snapshot =
            EvidenceSnapshot::project(&turn(vec![plan_ready(), run("DEFINITIVE_FAIL", None)]));
        assert_eq!(
            snapshot.next_obligation(),
            Some(Obligation::AutorepairFailedCriticalTests)
        );
        let block = snapshot.hard_block_message(3).unwrap();
        assert!(block.contains("autorepair_failed_critical_tests"));
        assert!(block.contains("DEFINITIVE_FAIL"));
    }

    #[test]
    fn test_needs_field_asks_for_dataset_then_acceptance() {
        let base = vec![plan_ready(), run("NEEDS_FIELD", None)];
        let snapshot = EvidenceSnapshot::project(&turn(base.clone()));
        assert_eq!(snapshot.obligations, vec![Obligation::AskDatasetDecision]);

        let mut with_choice = base.clone();
        with_choice.push(decision(DecisionTopic::Dataset, "use_synthetic"));
        let snapshot = EvidenceSnapshot::project(&turn(with_choice));
        assert_eq!(snapshot.obligations, vec![Obligation::CollectFieldEvidence]);

        let mut accepted = base;
        accepted.push(decision(DecisionTopic::Dataset, "accept_provisional"));
        let snapshot = EvidenceSnapshot::project(&turn(accepted));
        assert!(snapshot.obligations.is_empty());
    }

    #[test]
    fn test_needs_field_with_real_data_skips_dataset_question() {
        let output = json!({
            "decision": "NEEDS_FIELD",
            "dataset": {"action": "use_real", "concrete": true, "source": "data.csv"}
        });
        let snapshot = EvidenceSnapshot::project(&turn(vec![
            plan_ready(),
            stage_call("ExperimentRunners", output),
        ]));
        assert_eq!(snapshot.obligations, vec![Obligation::CollectFieldEvidence]);
    }

    #[test]
    fn test_provisional_pass_requires_acceptance() {
        let snapshot =
            EvidenceSnapshot::project(&turn(vec![plan_ready(), run("PROVISIONAL_PASS", None)]));
        assert_eq!(snapshot.obligations, vec![Obligation::CollectFieldEvidence]);

        let snapshot = EvidenceSnapshot::project(&turn(vec![
            plan_ready(),
            run("PROVISIONAL_PASS", None),
            decision(DecisionTopic::Provisional, "accept"),
        ]));
        assert!(snapshot.obligations.is_empty());
    }

    #[test]
    fn test_definitive_pass_is_done() {
        let snapshot =
            EvidenceSnapshot::project(&turn(vec![plan_ready(), run("DEFINITIVE_PASS", None)]));
        assert!(snapshot.obligations.is_empty());
    }

    #[test]
    fn test_latest_run_wins() {
        let snapshot = EvidenceSnapshot::project(&turn(vec![
            plan_ready(),
            run("DEFINITIVE_FAIL", None),
            run("NEEDS_FIELD", None),
        ]));
        assert_eq!(snapshot.last_decision(), Some(StageDecision::NeedsField));
        assert_eq!(snapshot.obligations, vec![Obligation::AskDatasetDecision]);
    }

    #[test]
    fn test_errored_latest_run_does_not_leak_stale_record() {
        let snapshot = EvidenceSnapshot::project(&turn(vec![
            plan_ready(),
            run("DEFINITIVE_PASS", None),
            stage_error("ExperimentRunners"),
        ]));
        assert!(!snapshot.experiment_completed());
        assert_eq!(snapshot.obligations, vec![Obligation::RunExperimentRunners]);
    }

    #[test]
    fn test_previous_turn_is_ignored() {
        let mut messages = turn(vec![plan_ready(), run("DEFINITIVE_FAIL", None)]);
        messages.push(Message::assistant_text("done", StopReason::EndTurn));
        messages.push(Message::user_text("thanks, unrelated question"));
        let snapshot = EvidenceSnapshot::project(&messages);
        assert!(!snapshot.pipeline_active);
        assert!(snapshot.obligations.is_empty());
    }

    #[test]
    fn test_projection_is_pure() {
        let messages = turn(vec![plan_ready(), run("NEEDS_FIELD", None)]);
        let first = EvidenceSnapshot::project(&messages);
        for _ in 0..5 {
            assert_eq!(EvidenceSnapshot::project(&messages), first);
        }
    }

    #[test]
    fn test_progress_does_not_change_obligations() {
        let mut messages = turn(vec![plan_ready()]);
        let before = EvidenceSnapshot::project(&messages);
        messages.push(Message::progress(None, "running tests"));
        messages.push(Message::progress(Some("toolu_x"), "50%"));
        let after = EvidenceSnapshot::project(&messages);
        assert_eq!(before.obligations, after.obligations);
        assert_eq!(before, after);
    }
}
