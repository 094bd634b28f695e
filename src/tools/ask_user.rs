//! Structured questions to the user
//!
//! The answer is recorded as a [`UserDecision`] so the gate can see what was
//! decided without reading free text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::{ProgressSink, Tool, ToolContext, ToolOutput};
use crate::evidence::{DecisionTopic, Evidence, UserDecision, ASK_USER_TOOL};
use crate::{Error, Result};

/// One selectable answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub label: String,
}

/// A question with a fixed set of answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default = "default_topic")]
    pub topic: DecisionTopic,
    pub options: Vec<QuestionOption>,
}

fn default_topic() -> DecisionTopic {
    DecisionTopic::General
}

/// Whoever answers questions: a terminal, a UI, a test script
#[async_trait]
pub trait UserPrompter: Send + Sync {
    /// Id of the chosen option, or `None` when nobody answered
    async fn ask(&self, question: &Question) -> Result<Option<String>>;
}

/// Prompter for non-interactive runs
pub struct NoPrompter;

#[async_trait]
impl UserPrompter for NoPrompter {
    async fn ask(&self, _question: &Question) -> Result<Option<String>> {
        Ok(None)
    }
}

pub struct AskUserTool {
    prompter: Arc<dyn UserPrompter>,
}

impl AskUserTool {
    pub fn new(prompter: Arc<dyn UserPrompter>) -> Self {
        Self { prompter }
    }
}

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        ASK_USER_TOOL
    }

    fn description(&self) -> &str {
        "Ask the user a multiple-choice question and wait for the answer"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "topic": {"type": "string", "enum": ["dataset", "provisional", "general"]},
                "options": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "label": {"type": "string"}
                        },
                        "required": ["id", "label"]
                    }
                }
            },
            "required": ["question", "options"]
        })
    }

    fn is_concurrency_safe(&self, _input: &Value) -> bool {
        false
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolContext) -> Result<()> {
        let question: Question = serde_json::from_value(input.clone())?;
        let mut ids: Vec<&str> = question.options.iter().map(|o| o.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != question.options.len() {
            return Err(Error::Tool("Option ids must be unique".to_string()));
        }
        Ok(())
    }

    async fn call(
        &self,
        input: Value,
        _ctx: &ToolContext,
        _progress: &ProgressSink,
    ) -> Result<ToolOutput> {
        let question: Question = serde_json::from_value(input)?;
        let Some(choice) = self.prompter.ask(&question).await? else {
            return Ok(ToolOutput::error("The user did not answer the question"));
        };

        let Some(option) = question.options.iter().find(|o| o.id == choice) else {
            return Ok(ToolOutput::error(format!(
                "The user picked an unknown option: {}",
                choice
            )));
        };
        info!("User chose {} for {:?}", option.id, question.topic);

        let decision = UserDecision {
            topic: question.topic,
            choice: option.id.clone(),
        };
        Ok(
            ToolOutput::success(format!("User selected: {} ({})", option.label, option.id))
                .with_evidence(Evidence::UserDecision(decision)),
        )
    }
}
