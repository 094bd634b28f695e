//! Line input shared by the chat loop and the prompters that run inside a
//! turn

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::Mutex;

use crate::hooks::PermissionPrompter;
use crate::tools::{Question, UserPrompter};
use crate::transcript::ToolUse;
use crate::Result;

type LineSource = Lines<Box<dyn AsyncBufRead + Unpin + Send>>;

/// One reader for the whole process so buffered input is never split
/// between consumers
#[derive(Clone)]
pub struct TerminalInput {
    lines: Arc<Mutex<LineSource>>,
}

impl TerminalInput {
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }

    pub fn from_reader(reader: impl AsyncBufRead + Unpin + Send + 'static) -> Self {
        let boxed: Box<dyn AsyncBufRead + Unpin + Send> = Box::new(reader);
        Self {
            lines: Arc::new(Mutex::new(boxed.lines())),
        }
    }

    /// Next line, or `None` at end of input
    pub async fn read_line(&self) -> Result<Option<String>> {
        let mut lines = self.lines.lock().await;
        Ok(lines.next_line().await?)
    }
}

/// Answers questions from the terminal
pub struct TerminalPrompter {
    input: TerminalInput,
}

impl TerminalPrompter {
    pub fn new(input: TerminalInput) -> Self {
        Self { input }
    }
}

/// Map an answer to an option id: a 1-based number or the id itself
fn resolve_answer(question: &Question, answer: &str) -> Option<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        return None;
    }
    if let Ok(n) = answer.parse::<usize>() {
        if let Some(option) = n.checked_sub(1).and_then(|i| question.options.get(i)) {
            return Some(option.id.clone());
        }
    }
    Some(answer.to_string())
}

#[async_trait]
impl UserPrompter for TerminalPrompter {
    async fn ask(&self, question: &Question) -> Result<Option<String>> {
        println!("\n\x1b[1m{}\x1b[0m", question.question);
        for (i, option) in question.options.iter().enumerate() {
            println!("  {}. {} \x1b[90m({})\x1b[0m", i + 1, option.label, option.id);
        }
        println!("Answer with a number or id (empty to skip):");

        let Some(line) = self.input.read_line().await? else {
            return Ok(None);
        };
        Ok(resolve_answer(question, &line))
    }
}

/// Asks y/n before a hook-flagged tool runs
pub struct TerminalPermissions {
    input: TerminalInput,
}

impl TerminalPermissions {
    pub fn new(input: TerminalInput) -> Self {
        Self { input }
    }
}

#[async_trait]
impl PermissionPrompter for TerminalPermissions {
    async fn confirm(&self, tool_use: &ToolUse, reason: &str) -> bool {
        println!("\n\x1b[33mAllow {}?\x1b[0m {} [y/N]", tool_use.name, reason);
        match self.input.read_line().await {
            Ok(Some(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}
