//! Hypothesis pipeline stage tools
//!
//! Each stage asks the model for a JSON contract reply through the staged
//! retry harness. A reply that does not parse counts as a transient
//! malformed-contract failure and is retried. The parsed result is saved to
//! the artifact store and returned as typed evidence.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{ProgressSink, Tool, ToolContext, ToolOutput};
use crate::artifacts::{ArtifactKey, ArtifactStore};
use crate::backend::{drain_events, BackendErrorKind, FailoverSlot, ModelRequest};
use crate::evidence::{Evidence, StageKind};
use crate::retry::{classify_backend_error, run_staged, StagePolicy};
use crate::session::SessionContext;
use crate::transcript::Message;
use crate::{Error, Result};

/// Shared collaborators of the stage tools
pub struct StageServices {
    pub slot: Arc<FailoverSlot>,
    pub policy: StagePolicy,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl StageServices {
    pub fn new(slot: Arc<FailoverSlot>, policy: StagePolicy, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            slot,
            policy,
            artifacts,
        }
    }
}

fn stage_prompt(stage: StageKind) -> &'static str {
    match stage {
        StageKind::Dialectical => include_str!("../../prompts/dialectical.md"),
        StageKind::Baconian => include_str!("../../prompts/baconian.md"),
        StageKind::Normalization => include_str!("../../prompts/normalization.md"),
        StageKind::Falsification => include_str!("../../prompts/falsification.md"),
        StageKind::ExperimentRunners => include_str!("../../prompts/experiment_runners.md"),
    }
}

/// Earlier stages whose saved output feeds this one
fn upstream(stage: StageKind, repairing: bool) -> Vec<StageKind> {
    match stage {
        StageKind::Dialectical | StageKind::Baconian | StageKind::Normalization => Vec::new(),
        StageKind::Falsification => vec![
            StageKind::Dialectical,
            StageKind::Baconian,
            StageKind::Normalization,
        ],
        StageKind::ExperimentRunners if repairing => {
            vec![StageKind::Falsification, StageKind::ExperimentRunners]
        }
        StageKind::ExperimentRunners => vec![StageKind::Falsification],
    }
}

/// Pull the JSON object out of a model reply, tolerating code fences and
/// surrounding prose
pub(crate) fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value.is_object().then_some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Parse a stage reply into its payload and evidence
fn parse_contract(stage: StageKind, text: &str) -> Result<(Value, Evidence)> {
    let value = extract_json(text).ok_or_else(|| {
        Error::backend(
            BackendErrorKind::MalformedContract,
            format!("{} reply contained no JSON object", stage),
        )
    })?;
    let evidence = Evidence::from_stage_output(stage, &value).map_err(|e| {
        Error::backend(
            BackendErrorKind::MalformedContract,
            format!("{} reply did not match its contract: {}", stage, e),
        )
    })?;
    Ok((value, evidence))
}

/// One pipeline stage exposed as a tool
pub struct StageTool {
    stage: StageKind,
    services: Arc<StageServices>,
}

impl StageTool {
    pub fn new(stage: StageKind, services: Arc<StageServices>) -> Self {
        Self { stage, services }
    }

    fn key(&self, session: &SessionContext, stage: StageKind) -> Result<ArtifactKey> {
        ArtifactKey::new(&session.app, &session.user, &session.id, stage.artifact_name())
    }

    async fn build_request(&self, input: &Value, session: &SessionContext) -> Result<ModelRequest> {
        let hypothesis = input
            .get("hypothesis")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Tool("hypothesis is required".to_string()))?;
        let repair: Vec<&str> = input
            .get("repair_failed_tests")
            .and_then(Value::as_array)
            .map(|tests| tests.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut body = format!("Hypothesis: {}\n", hypothesis);
        if let Some(context) = input.get("context").and_then(Value::as_str) {
            body.push_str(&format!("\nContext: {}\n", context));
        }

        for prior in upstream(self.stage, !repair.is_empty()) {
            let key = self.key(session, prior)?;
            if let Some(saved) = self.services.artifacts.load(&key, None).await? {
                body.push_str(&format!(
                    "\n## {}\n```json\n{}\n```\n",
                    prior.artifact_name(),
                    serde_json::to_string_pretty(&saved)?
                ));
            }
        }

        if !repair.is_empty() {
            body.push_str(&format!(
                "\nRepair mode: rerun only these failed tests: {}\n",
                repair.join(", ")
            ));
        }

        Ok(ModelRequest::new(stage_prompt(self.stage), vec![Message::user_text(body)]))
    }
}

#[async_trait]
impl Tool for StageTool {
    fn name(&self) -> &str {
        self.stage.tool_name()
    }

    fn description(&self) -> &str {
        match self.stage {
            StageKind::Dialectical => "Thesis, antithesis and synthesis for a hypothesis",
            StageKind::Baconian => "Baconian tables of presence, absence and degrees",
            StageKind::Normalization => "Restate a hypothesis as variables and testable predictions",
            StageKind::Falsification => "Design critical tests that could falsify a hypothesis",
            StageKind::ExperimentRunners => {
                "Run the falsification plan and report a verdict with its dataset decision"
            }
        }
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "hypothesis": {"type": "string", "minLength": 1},
                "context": {"type": "string"},
                "repair_failed_tests": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["hypothesis"]
        })
    }

    fn is_concurrency_safe(&self, _input: &Value) -> bool {
        matches!(
            self.stage,
            StageKind::Dialectical | StageKind::Baconian | StageKind::Normalization
        )
    }

    async fn call(
        &self,
        input: Value,
        ctx: &ToolContext,
        progress: &ProgressSink,
    ) -> Result<ToolOutput> {
        let request = self.build_request(&input, &ctx.session).await?;
        let stage = self.stage;
        progress.send(format!("Running {} stage", stage));

        let request = &request;
        let outcome = run_staged(
            stage.tool_name(),
            &self.services.policy,
            &self.services.slot,
            &ctx.abort,
            classify_backend_error,
            move |attempt| async move {
                if attempt.attempt > 0 {
                    progress.send(format!("Retrying {} (attempt {})", stage, attempt.attempt + 1));
                }
                let events = attempt.backend.stream(request, &attempt.scope).await?;
                let message = drain_events(events, &attempt.budget).await?;
                parse_contract(stage, &message.joined_text())
            },
        )
        .await?;

        let (value, evidence) = outcome.value;
        let key = self.key(&ctx.session, stage)?;
        match self.services.artifacts.save(&key, value.clone()).await {
            Ok(version) => {
                info!("Saved {} v{}", key, version);
                progress.send(format!("Saved {} (version {})", stage.artifact_name(), version));
            }
            Err(e) => warn!("Could not save {}: {}", key, e),
        }

        Ok(ToolOutput::success(serde_json::to_string_pretty(&value)?).with_evidence(evidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::FileArtifactStore;
    use crate::backend::{ScriptStep, ScriptedBackend};
    use crate::budget::{AbortScope, BudgetLimits};
    use crate::evidence::{PlanStatus, StageDecision};
    use crate::tools::ToolUseContext;
    use std::time::Duration;

    fn policy() -> StagePolicy {
        StagePolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
            attempt_timeout: Duration::from_secs(5),
            turn_timeout: Duration::from_secs(60),
            deterministic: true,
            failover_after: 0,
            budget: BudgetLimits::default(),
        }
    }

    fn setup(steps: Vec<ScriptStep>) -> (Arc<ScriptedBackend>, Arc<StageServices>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(steps));
        let services = Arc::new(StageServices::new(
            Arc::new(FailoverSlot::new(backend.clone())),
            policy(),
            Arc::new(FileArtifactStore::new(dir.path().to_path_buf())),
        ));
        (backend, services, dir)
    }

    fn ctx() -> ToolContext {
        ToolContext {
            tool_use_id: "toolu_stage".to_string(),
            context: ToolUseContext::default(),
            session: Arc::new(SessionContext::new("s1", "ana", "popper", Duration::from_secs(60))),
            abort: AbortScope::new(),
        }
    }

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"status\": \"ready\"}\n```";
        assert_eq!(extract_json(reply), Some(json!({"status": "ready"})));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("[1, 2]"), None);
    }

    #[tokio::test]
    async fn test_plan_is_saved_and_returned_as_evidence() {
        let (_backend, services, _dir) = setup(vec![ScriptStep::json(json!({
            "status": "ready",
            "critical_tests": [{"id": "t1", "description": "measure"}]
        }))]);
        let tool = StageTool::new(StageKind::Falsification, services.clone());
        let context = ctx();

        let output = tool
            .call(json!({"hypothesis": "h"}), &context, &ProgressSink::discard())
            .await
            .unwrap();
        match output.evidence {
            Some(Evidence::FalsificationPlan(plan)) => assert_eq!(plan.status, PlanStatus::Ready),
            other => panic!("unexpected evidence: {:?}", other),
        }

        let key = ArtifactKey::new("popper", "ana", "s1", "falsification_plan.json").unwrap();
        assert_eq!(services.artifacts.list_versions(&key).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_retried() {
        let (backend, services, _dir) = setup(vec![
            ScriptStep::text("I think it's fine"),
            ScriptStep::json(json!({"decision": "PROVISIONAL_PASS", "toy_truth": "PASS"})),
        ]);
        let tool = StageTool::new(StageKind::ExperimentRunners, services);

        let output = tool
            .call(json!({"hypothesis": "h"}), &ctx(), &ProgressSink::discard())
            .await
            .unwrap();
        assert_eq!(backend.calls(), 2);
        match output.evidence {
            Some(Evidence::ExperimentRun(run)) => {
                assert_eq!(run.decision, StageDecision::ProvisionalPass)
            }
            other => panic!("unexpected evidence: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_experiment_request_includes_saved_plan() {
        let (backend, services, _dir) = setup(vec![
            ScriptStep::json(json!({"status": "ready"})),
            ScriptStep::json(json!({"decision": "NEEDS_FIELD"})),
        ]);
        let context = ctx();
        StageTool::new(StageKind::Falsification, services.clone())
            .call(json!({"hypothesis": "h"}), &context, &ProgressSink::discard())
            .await
            .unwrap();
        StageTool::new(StageKind::ExperimentRunners, services)
            .call(
                json!({"hypothesis": "h", "repair_failed_tests": ["t2"]}),
                &context,
                &ProgressSink::discard(),
            )
            .await
            .unwrap();

        let requests = backend.requests();
        let body = match &requests[1].messages[0] {
            Message::User(user) => user.text(),
            other => panic!("unexpected message: {:?}", other),
        };
        assert!(body.contains("falsification_plan.json"));
        assert!(body.contains("rerun only these failed tests: t2"));
    }

    #[tokio::test]
    async fn test_fatal_backend_error_surfaces() {
        let (_backend, services, _dir) =
            setup(vec![ScriptStep::fail(BackendErrorKind::Auth, "bad key")]);
        let tool = StageTool::new(StageKind::Normalization, services);
        let err = tool
            .call(json!({"hypothesis": "h"}), &ctx(), &ProgressSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Backend {
                kind: BackendErrorKind::Auth,
                ..
            }
        ));
    }

    #[test]
    fn test_only_analysis_stages_are_parallel() {
        let (_backend, services, _dir) = setup(Vec::new());
        let safe: Vec<bool> = StageKind::ALL
            .into_iter()
            .map(|s| StageTool::new(s, services.clone()).is_concurrency_safe(&json!({})))
            .collect();
        assert_eq!(safe, vec![true, true, true, false, false]);
    }
}
