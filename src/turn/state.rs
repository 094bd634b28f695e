//! Turn loop states and outcomes

use std::fmt;

use crate::evidence::Obligation;
use crate::transcript::AssistantMessage;

/// Shown when a turn is cancelled
pub const INTERRUPT_MESSAGE: &str = "[Request interrupted by user]";

/// Replaces an empty final answer
pub const NO_CONTENT_MESSAGE: &str = "(no content)";

/// Prefix of the message shown when a model call fails
pub const API_ERROR_PREFIX: &str = "API Error";

/// Where the loop is
#[derive(Debug)]
pub(crate) enum TurnState {
    Init,
    ModelCall,
    /// The model answered without tool calls and nothing is owed
    StopHook(AssistantMessage),
    /// Tool calls to run, requested or synthesized
    ToolExecution(AssistantMessage),
    Recurse,
    Done(TurnStop),
}

impl TurnState {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            TurnState::Init => "init",
            TurnState::ModelCall => "model_call",
            TurnState::StopHook(_) => "stop_hook",
            TurnState::ToolExecution(_) => "tool_execution",
            TurnState::Recurse => "recurse",
            TurnState::Done(_) => "done",
        }
    }
}

/// Why a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStop {
    /// Final answer given
    Completed,
    /// An obligation stayed unmet past its ceiling
    HardBlocked(Obligation),
    Interrupted,
    /// A model call failed
    ApiError,
    /// Too many model calls in one turn
    DepthExceeded,
}

impl fmt::Display for TurnStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnStop::Completed => write!(f, "completed"),
            TurnStop::HardBlocked(obligation) => write!(f, "hard-blocked on {}", obligation),
            TurnStop::Interrupted => write!(f, "interrupted"),
            TurnStop::ApiError => write!(f, "api error"),
            TurnStop::DepthExceeded => write!(f, "depth exceeded"),
        }
    }
}

/// Summary of a finished turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub stop: TurnStop,
    /// Text of the last assistant message
    pub final_text: String,
    pub model_calls: u32,
    /// Tool calls added by the evidence gate
    pub synthesized_calls: u32,
    pub stop_continuations: u32,
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        self.stop == TurnStop::Completed
    }
}
