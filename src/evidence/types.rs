//! Typed evidence carried by tool results
//!
//! Stage tools emit structured JSON. It is parsed into these types once,
//! when the result enters the transcript, so the gate never re-reads raw
//! payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Pipeline stages, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Dialectical,
    Baconian,
    Normalization,
    Falsification,
    ExperimentRunners,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Dialectical,
        StageKind::Baconian,
        StageKind::Normalization,
        StageKind::Falsification,
        StageKind::ExperimentRunners,
    ];

    /// Tool name the model calls for this stage
    pub fn tool_name(&self) -> &'static str {
        match self {
            StageKind::Dialectical => "DialecticalAnalysis",
            StageKind::Baconian => "BaconianAnalysis",
            StageKind::Normalization => "Normalization",
            StageKind::Falsification => "FalsificationPlan",
            StageKind::ExperimentRunners => "ExperimentRunners",
        }
    }

    /// Stage for a tool name, if it is a pipeline tool
    pub fn from_tool_name(name: &str) -> Option<Self> {
        StageKind::ALL.into_iter().find(|s| s.tool_name() == name)
    }

    /// Artifact filename used to persist this stage's output
    pub fn artifact_name(&self) -> &'static str {
        match self {
            StageKind::Dialectical => "dialectical.json",
            StageKind::Baconian => "baconian.json",
            StageKind::Normalization => "normalization.json",
            StageKind::Falsification => "falsification_plan.json",
            StageKind::ExperimentRunners => "experiment_runs.json",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Dialectical => "dialectical",
            StageKind::Baconian => "baconian",
            StageKind::Normalization => "normalization",
            StageKind::Falsification => "falsification",
            StageKind::ExperimentRunners => "experiment_runners",
        };
        write!(f, "{}", name)
    }
}

/// Verdict of the experiment-execution stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageDecision {
    RejectEarly,
    ProvisionalPass,
    NeedsField,
    DefinitivePass,
    DefinitiveFail,
}

impl fmt::Display for StageDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageDecision::RejectEarly => "REJECT_EARLY",
            StageDecision::ProvisionalPass => "PROVISIONAL_PASS",
            StageDecision::NeedsField => "NEEDS_FIELD",
            StageDecision::DefinitivePass => "DEFINITIVE_PASS",
            StageDecision::DefinitiveFail => "DEFINITIVE_FAIL",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for StageDecision {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(['-', ' '], "_").as_str() {
            "REJECT_EARLY" => Ok(StageDecision::RejectEarly),
            "PROVISIONAL_PASS" => Ok(StageDecision::ProvisionalPass),
            "NEEDS_FIELD" => Ok(StageDecision::NeedsField),
            "DEFINITIVE_PASS" => Ok(StageDecision::DefinitivePass),
            "DEFINITIVE_FAIL" => Ok(StageDecision::DefinitiveFail),
            other => Err(Error::Tool(format!("Unknown stage decision: {}", other))),
        }
    }
}

/// Outcome of the toy (synthetic) truth check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToyTruth {
    Pass,
    Fail,
    Inconclusive,
}

/// Readiness of a falsification plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Ready,
    Draft,
    Blocked,
}

/// What the experiment stage did about data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetAction {
    /// A real dataset was used
    UseReal,
    /// A dataset matching the hypothesis domain was used
    UseMatching,
    /// Only synthetic / toy data was used
    Synthetic,
    /// The stage could not pick a dataset and needs the user
    AskUser,
    /// No dataset was involved
    None,
}

/// Dataset decision reported by the experiment stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDecision {
    pub action: DatasetAction,
    /// Whether a concrete dataset (path/URL/name) was identified
    #[serde(default)]
    pub concrete: bool,
    #[serde(default)]
    pub source: Option<String>,
}

impl DatasetDecision {
    /// Real or domain-matching data, concretely identified
    pub fn has_real_data(&self) -> bool {
        matches!(self.action, DatasetAction::UseReal | DatasetAction::UseMatching) && self.concrete
    }
}

impl Default for DatasetDecision {
    fn default() -> Self {
        Self {
            action: DatasetAction::None,
            concrete: false,
            source: None,
        }
    }
}

/// Dialectical analysis output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialecticalEvidence {
    pub thesis: String,
    pub antithesis: String,
    pub synthesis: String,
}

/// Baconian tables of presence/absence/degrees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaconianEvidence {
    #[serde(default)]
    pub presence: Vec<String>,
    #[serde(default)]
    pub absence: Vec<String>,
    #[serde(default)]
    pub degrees: Vec<String>,
}

/// Normalized, testable form of the hypothesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationEvidence {
    pub hypothesis: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub predictions: Vec<String>,
}

/// One critical test in a falsification plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalTest {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub falsifies_if: Option<String>,
}

/// Falsification plan output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FalsificationEvidence {
    pub status: PlanStatus,
    #[serde(default)]
    pub critical_tests: Vec<CriticalTest>,
}

/// Experiment runner output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEvidence {
    pub decision: StageDecision,
    #[serde(default)]
    pub toy_truth: Option<ToyTruth>,
    #[serde(default)]
    pub dataset: DatasetDecision,
    #[serde(default)]
    pub failed_tests: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// What a user decision is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTopic {
    Dataset,
    Provisional,
    General,
}

/// A structured answer from the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDecision {
    pub topic: DecisionTopic,
    /// Option id the user picked
    pub choice: String,
}

impl UserDecision {
    /// Choices that settle the dataset question
    pub fn resolves_dataset(&self) -> bool {
        self.topic == DecisionTopic::Dataset
            && matches!(
                self.choice.as_str(),
                "provide_dataset" | "use_synthetic" | "accept_provisional" | "stop"
            )
    }

    /// Choices that accept a provisional verdict
    pub fn accepts_provisional(&self) -> bool {
        matches!(self.topic, DecisionTopic::Provisional | DecisionTopic::Dataset)
            && matches!(self.choice.as_str(), "accept_provisional" | "accept")
    }

    /// The user asked to stop pursuing the pipeline
    pub fn is_stop(&self) -> bool {
        self.choice == "stop"
    }
}

/// Per-tool typed evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    Dialectical(DialecticalEvidence),
    Baconian(BaconianEvidence),
    Normalization(NormalizationEvidence),
    FalsificationPlan(FalsificationEvidence),
    ExperimentRun(ExperimentEvidence),
    UserDecision(UserDecision),
}

impl Evidence {
    /// Pipeline stage this evidence belongs to, if any
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            Evidence::Dialectical(_) => Some(StageKind::Dialectical),
            Evidence::Baconian(_) => Some(StageKind::Baconian),
            Evidence::Normalization(_) => Some(StageKind::Normalization),
            Evidence::FalsificationPlan(_) => Some(StageKind::Falsification),
            Evidence::ExperimentRun(_) => Some(StageKind::ExperimentRunners),
            Evidence::UserDecision(_) => None,
        }
    }

    /// Parse a stage's JSON output into typed evidence
    pub fn from_stage_output(stage: StageKind, value: &Value) -> crate::Result<Self> {
        let evidence = match stage {
            StageKind::Dialectical => Evidence::Dialectical(serde_json::from_value(value.clone())?),
            StageKind::Baconian => Evidence::Baconian(serde_json::from_value(value.clone())?),
            StageKind::Normalization => {
                Evidence::Normalization(serde_json::from_value(value.clone())?)
            }
            StageKind::Falsification => {
                Evidence::FalsificationPlan(serde_json::from_value(value.clone())?)
            }
            StageKind::ExperimentRunners => {
                Evidence::ExperimentRun(serde_json::from_value(value.clone())?)
            }
        };
        Ok(evidence)
    }

    /// Ingest a raw tool result by tool name. Unknown tools and malformed
    /// payloads carry no evidence.
    pub fn ingest(tool_name: &str, content: &str) -> Option<Self> {
        let stage = StageKind::from_tool_name(tool_name)?;
        let value: Value = serde_json::from_str(content).ok()?;
        Self::from_stage_output(stage, &value).ok()
    }
}
