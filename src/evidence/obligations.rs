//! Pipeline obligations and the tool calls that discharge them

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use super::{EvidenceSnapshot, StageKind};
use crate::config::GateConfig;
use crate::transcript::ToolUse;

/// Tool used to put a structured question to the user
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// A requirement blocking the final answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Obligation {
    RunFalsificationPlan,
    RunExperimentRunners,
    AutorepairFailedCriticalTests,
    AskDatasetDecision,
    CollectFieldEvidence,
}

impl Obligation {
    pub fn id(&self) -> &'static str {
        match self {
            Obligation::RunFalsificationPlan => "run_falsification_plan",
            Obligation::RunExperimentRunners => "run_experiment_runners",
            Obligation::AutorepairFailedCriticalTests => "autorepair_failed_critical_tests",
            Obligation::AskDatasetDecision => "ask_dataset_decision",
            Obligation::CollectFieldEvidence => "collect_field_evidence",
        }
    }

    /// Strict obligations get the hard ceiling, the rest the soft one
    pub fn is_strict(&self) -> bool {
        matches!(
            self,
            Obligation::RunFalsificationPlan
                | Obligation::RunExperimentRunners
                | Obligation::AutorepairFailedCriticalTests
        )
    }

    /// Synthesis attempts allowed before hard-blocking
    pub fn ceiling(&self, gate: &GateConfig) -> u32 {
        if self.is_strict() {
            gate.hard_ceiling
        } else {
            gate.soft_ceiling
        }
    }

    /// Tool whose call discharges this obligation
    pub fn tool_name(&self) -> &'static str {
        match self {
            Obligation::RunFalsificationPlan => StageKind::Falsification.tool_name(),
            Obligation::RunExperimentRunners | Obligation::AutorepairFailedCriticalTests => {
                StageKind::ExperimentRunners.tool_name()
            }
            Obligation::AskDatasetDecision | Obligation::CollectFieldEvidence => ASK_USER_TOOL,
        }
    }

    /// What the model is told it still owes
    pub fn instruction(&self, snapshot: &EvidenceSnapshot) -> String {
        match self {
            Obligation::RunFalsificationPlan => format!(
                "Hypothesis testing is under way but there is no ready falsification plan. \
                 Call {} and get a plan with status `ready` before answering.",
                self.tool_name()
            ),
            Obligation::RunExperimentRunners => format!(
                "The falsification plan is ready but no experiment has been run. \
                 Requiring {} before a final answer: call it against the plan's critical tests.",
                self.tool_name()
            ),
            Obligation::AutorepairFailedCriticalTests => {
                let failed = snapshot
                    .experiment
                    .as_ref()
                    .map(|e| e.failed_tests.join(", "))
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "unspecified".to_string());
                format!(
                    "The latest experiment run ended {} with failed critical tests ({}). \
                     Repair the failing tests and call {} again.",
                    snapshot
                        .last_decision()
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    failed,
                    self.tool_name()
                )
            }
            Obligation::AskDatasetDecision => format!(
                "The experiment needs field data and no real dataset was identified. \
                 Use {} to ask the user how to proceed with data.",
                self.tool_name()
            ),
            Obligation::CollectFieldEvidence => format!(
                "The verdict is provisional. Use {} to ask the user to accept the provisional \
                 result or supply field evidence.",
                self.tool_name()
            ),
        }
    }
}

impl fmt::Display for Obligation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Tool calls that discharge the snapshot's next obligation
pub fn synthesize_tool_uses(snapshot: &EvidenceSnapshot) -> Vec<ToolUse> {
    let Some(obligation) = snapshot.next_obligation() else {
        return Vec::new();
    };
    let hypothesis = snapshot.hypothesis_text();

    let input = match obligation {
        Obligation::RunFalsificationPlan | Obligation::RunExperimentRunners => {
            json!({ "hypothesis": hypothesis })
        }
        Obligation::AutorepairFailedCriticalTests => {
            let failed = snapshot
                .experiment
                .as_ref()
                .map(|e| e.failed_tests.clone())
                .unwrap_or_default();
            json!({ "hypothesis": hypothesis, "repair_failed_tests": failed })
        }
        Obligation::AskDatasetDecision => json!({
            "topic": "dataset",
            "question": "The experiment needs field data. How should I proceed?",
            "options": [
                {"id": "provide_dataset", "label": "I will provide a dataset"},
                {"id": "use_synthetic", "label": "Continue with synthetic data"},
                {"id": "accept_provisional", "label": "Accept the provisional verdict"},
                {"id": "stop", "label": "Stop here"},
            ]
        }),
        Obligation::CollectFieldEvidence => json!({
            "topic": "provisional",
            "question": "The verdict is provisional until field evidence is collected. Accept it?",
            "options": [
                {"id": "accept_provisional", "label": "Accept the provisional verdict"},
                {"id": "provide_dataset", "label": "I will collect field evidence"},
                {"id": "stop", "label": "Stop here"},
            ]
        }),
    };

    vec![ToolUse::new(obligation.tool_name(), input)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Message;

    #[test]
    fn test_strictness() {
        let gate = GateConfig {
            hard_ceiling: 3,
            soft_ceiling: 1,
        };
        assert_eq!(Obligation::RunExperimentRunners.ceiling(&gate), 3);
        assert_eq!(Obligation::AutorepairFailedCriticalTests.ceiling(&gate), 3);
        assert_eq!(Obligation::AskDatasetDecision.ceiling(&gate), 1);
        assert_eq!(Obligation::CollectFieldEvidence.ceiling(&gate), 1);
    }

    #[test]
    fn test_ids_match_serde() {
        for obligation in [
            Obligation::RunFalsificationPlan,
            Obligation::RunExperimentRunners,
            Obligation::AutorepairFailedCriticalTests,
            Obligation::AskDatasetDecision,
            Obligation::CollectFieldEvidence,
        ] {
            let value = serde_json::to_value(obligation).unwrap();
            assert_eq!(value, obligation.id());
        }
    }

    #[test]
    fn test_synthesis_uses_prompt_as_hypothesis() {
        let tool_use = ToolUse::new("FalsificationPlan", serde_json::json!({}));
        let messages = vec![
            Message::user_text("Plants grow faster under blue light"),
            Message::Assistant(crate::transcript::AssistantMessage::new(
                vec![],
                vec![tool_use.clone()],
                crate::transcript::StopReason::ToolUse,
            )),
            Message::tool_result(crate::transcript::ToolResultBlock::error(&tool_use, "boom")),
        ];
        let snapshot = EvidenceSnapshot::project(&messages);
        let calls = synthesize_tool_uses(&snapshot);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "FalsificationPlan");
        assert_eq!(
            calls[0].input["hypothesis"],
            "Plants grow faster under blue light"
        );
    }

    #[test]
    fn test_nothing_to_synthesize_without_obligation() {
        let snapshot = EvidenceSnapshot::project(&[Message::user_text("hi")]);
        assert!(synthesize_tool_uses(&snapshot).is_empty());
    }
}
