//! Popper: evidence-gated tool-calling agent
//!
//! A conversational agent that lets a model call tools in a loop until it
//! produces a final answer. Hypothesis-testing requests are held to a fixed
//! pipeline:
//! - **Stages**: dialectical, baconian, normalization, falsification, experiment runs
//! - **Evidence gate**: the model may not stop while a pipeline obligation is owed
//! - **Visible failure**: every error path ends in a message the user can read
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Turn loop                  │
//! │  model call → gate → queue → recurse    │
//! └───────┬──────────────────────┬──────────┘
//!         ▼                      ▼
//! ┌───────────────┐      ┌──────────────────┐
//! │ Evidence gate │      │ Tool exec queue  │
//! │ (pure fn)     │      │ (safety barrier) │
//! └───────────────┘      └────────┬─────────┘
//!                                 ▼
//!                ┌─────────────────────────────────┐
//!                │ Stage tools                      │
//!                │ retry harness + artifact store   │
//!                └─────────────────────────────────┘
//! ```

pub mod artifacts;
pub mod backend;
pub mod budget;
pub mod config;
pub mod evidence;
pub mod hooks;
pub mod interactive;
pub mod queue;
pub mod retry;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod turn;

// Re-exports for convenience
pub use artifacts::{ArtifactKey, ArtifactStore, FileArtifactStore};
pub use backend::{BackendErrorKind, FailoverSlot, ModelBackend};
pub use budget::{AbortCause, AbortScope, BudgetExceeded, ExecutionBudget, TimeoutScope};
pub use config::Config;
pub use evidence::{EvidenceSnapshot, Obligation};
pub use queue::ToolExecutionQueue;
pub use session::SessionContext;
pub use transcript::{Message, Transcript};
pub use turn::{TurnLoop, TurnOutcome};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error ({kind}): {message}")]
    Backend {
        kind: BackendErrorKind,
        message: String,
    },

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("{0} timed out")]
    Timeout(TimeoutScope),

    #[error("Execution budget exceeded: {0}")]
    BudgetExceeded(BudgetExceeded),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Shorthand for a classified backend error
    pub fn backend(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Error::Backend {
            kind,
            message: message.into(),
        }
    }

    /// Transient failures are worth another attempt; permanent ones are not
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Backend { kind, .. } => kind.is_transient(),
            Error::Timeout(_) | Error::BudgetExceeded(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Whether this error came from a cancelled abort scope
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Build the error an aborted scope should surface
    pub fn from_abort(cause: &AbortCause) -> Self {
        match cause {
            AbortCause::UserInterrupt => Error::Cancelled,
            AbortCause::Timeout(scope) => Error::Timeout(*scope),
            AbortCause::Budget(exceeded) => Error::BudgetExceeded(exceeded.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
