//! Slash commands for the chat loop

use std::collections::HashMap;

/// What a slash command does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Help,
    /// Start over with an empty transcript
    Clear,
    /// Show session id, message count and working directory
    Status,
    /// List saved sessions
    Sessions,
    /// List artifacts of this session
    Artifacts,
    Exit,
}

/// A registered command
#[derive(Debug, Clone)]
pub struct Command {
    /// Name without the slash
    pub name: &'static str,
    pub description: &'static str,
    pub action: ControlAction,
    pub aliases: &'static [&'static str],
}

/// Parsed `/name args...` input
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandInvocation {
    /// Parse a line. Returns `None` unless it starts with `/`.
    pub fn parse(input: &str) -> Option<Self> {
        let rest = input.trim().strip_prefix('/')?;

        let mut parts = rest.splitn(2, char::is_whitespace);
        let name = parts.next()?.to_lowercase();
        if name.is_empty() {
            return None;
        }
        let raw_args = parts.next().unwrap_or("").trim();

        let args = if raw_args.is_empty() {
            Vec::new()
        } else {
            shell_words::split(raw_args)
                .unwrap_or_else(|_| raw_args.split_whitespace().map(String::from).collect())
        };

        Some(Self { name, args })
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Commands by name and alias
pub struct CommandRegistry {
    commands: Vec<Command>,
    aliases: HashMap<&'static str, usize>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            commands: Vec::new(),
            aliases: HashMap::new(),
        };
        registry.register(Command {
            name: "help",
            description: "Show available commands",
            action: ControlAction::Help,
            aliases: &["?", "h"],
        });
        registry.register(Command {
            name: "clear",
            description: "Start a fresh conversation",
            action: ControlAction::Clear,
            aliases: &[],
        });
        registry.register(Command {
            name: "status",
            description: "Show the current session",
            action: ControlAction::Status,
            aliases: &["s"],
        });
        registry.register(Command {
            name: "sessions",
            description: "List saved sessions",
            action: ControlAction::Sessions,
            aliases: &[],
        });
        registry.register(Command {
            name: "artifacts",
            description: "List artifacts saved in this session",
            action: ControlAction::Artifacts,
            aliases: &["a"],
        });
        registry.register(Command {
            name: "exit",
            description: "Leave the session",
            action: ControlAction::Exit,
            aliases: &["quit", "q"],
        });
        registry
    }

    pub fn register(&mut self, command: Command) {
        let index = self.commands.len();
        self.aliases.insert(command.name, index);
        for alias in command.aliases {
            self.aliases.insert(*alias, index);
        }
        self.commands.push(command);
    }

    /// Look up by name or alias
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.aliases
            .get(name.to_lowercase().as_str())
            .and_then(|&i| self.commands.get(i))
    }

    pub fn resolve(&self, invocation: &CommandInvocation) -> Option<ControlAction> {
        self.get(&invocation.name).map(|c| c.action)
    }

    pub fn help(&self) -> String {
        let mut lines = vec!["Available commands:".to_string(), String::new()];
        for cmd in &self.commands {
            let aliases = if cmd.aliases.is_empty() {
                String::new()
            } else {
                format!(" ({})", cmd.aliases.join(", "))
            };
            lines.push(format!("  /{}{} - {}", cmd.name, aliases, cmd.description));
        }
        lines.join("\n")
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
