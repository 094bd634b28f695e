//! Interactive chat
//!
//! A line-oriented loop over [`TurnLoop`](crate::TurnLoop) with slash
//! commands, Ctrl-C interruption and terminal prompts for questions and
//! permissions.

pub mod commands;
pub mod render;
pub mod repl;
pub mod signals;
pub mod terminal;

pub use commands::{CommandInvocation, CommandRegistry, ControlAction};
pub use repl::{format_session, ChatSession};
pub use signals::{install_panic_handler, SignalHandler};
pub use terminal::{TerminalInput, TerminalPermissions, TerminalPrompter};
