//! The chat loop: read a line, run a turn, render, save

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::commands::{CommandInvocation, CommandRegistry, ControlAction};
use super::render::{print_error, print_system, render};
use super::signals::SignalHandler;
use super::terminal::TerminalInput;
use crate::artifacts::ArtifactStore;
use crate::budget::AbortScope;
use crate::transcript::{Message, SessionSummary, Transcript, TranscriptStore};
use crate::turn::{TurnLoop, TurnOutcome};
use crate::Result;

/// One line per saved session
pub fn format_session(summary: &SessionSummary) -> String {
    format!(
        "{}  {}  {:>4} msgs  {}",
        summary.id,
        summary.updated.format("%Y-%m-%d %H:%M"),
        summary.messages,
        summary.title.as_deref().unwrap_or("(untitled)")
    )
}

/// Interactive session over one transcript
pub struct ChatSession {
    turn_loop: TurnLoop,
    rendered: mpsc::UnboundedReceiver<Message>,
    transcript: Transcript,
    store: TranscriptStore,
    artifacts: Arc<dyn ArtifactStore>,
    input: TerminalInput,
    signals: SignalHandler,
    commands: CommandRegistry,
}

impl ChatSession {
    pub fn new(
        turn_loop: TurnLoop,
        transcript: Transcript,
        store: TranscriptStore,
        artifacts: Arc<dyn ArtifactStore>,
        input: TerminalInput,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            turn_loop: turn_loop.with_observer(tx),
            rendered: rx,
            transcript,
            store,
            artifacts,
            input,
            signals: SignalHandler::new(),
            commands: CommandRegistry::new(),
        }
    }

    /// Route Ctrl-C through `signals`
    pub fn with_signals(mut self, signals: SignalHandler) -> Self {
        self.signals = signals;
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Run until `/exit` or end of input
    pub async fn run(&mut self) -> Result<()> {
        print_system(&format!(
            "popper session {} (type /help for commands, Ctrl-C to interrupt)",
            self.transcript.id
        ));

        loop {
            print!("\n> ");
            // Prompt visibility only
            let _ = std::io::Write::flush(&mut std::io::stdout());

            let Some(line) = self.input.read_line().await? else {
                debug!("End of input");
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(invocation) = CommandInvocation::parse(line) {
                match self.commands.resolve(&invocation) {
                    Some(ControlAction::Exit) => break,
                    Some(action) => self.handle_command(action).await,
                    None => print_error(&format!(
                        "Unknown command: /{} (try /help)",
                        invocation.name
                    )),
                }
                continue;
            }

            let outcome = self.run_turn(line).await;
            if !outcome.is_completed() {
                print_system(&format!("Turn ended: {}", outcome.stop));
            }
            if let Err(e) = self.store.save(&self.transcript) {
                warn!("Failed to save session {}: {}", self.transcript.id, e);
            }
        }

        self.store.save(&self.transcript)?;
        print_system(&format!("Session saved: {}", self.transcript.id));
        Ok(())
    }

    /// One turn, rendering messages while it runs
    async fn run_turn(&mut self, prompt: &str) -> TurnOutcome {
        let scope = AbortScope::new();
        self.signals.arm(scope.clone());

        let turn = self.turn_loop.run_turn(&mut self.transcript, prompt, &scope);
        tokio::pin!(turn);
        let outcome = loop {
            tokio::select! {
                outcome = &mut turn => break outcome,
                Some(message) = self.rendered.recv() => show(&message),
            }
        };
        while let Ok(message) = self.rendered.try_recv() {
            show(&message);
        }

        self.signals.disarm();
        outcome
    }

    async fn handle_command(&mut self, action: ControlAction) {
        match action {
            ControlAction::Help => println!("{}", self.commands.help()),
            ControlAction::Clear => {
                self.transcript = Transcript::with_id(&self.transcript.id);
                print_system("Conversation cleared");
            }
            ControlAction::Status => {
                print_system(&format!("Session:   {}", self.transcript.id));
                print_system(&format!("Messages:  {}", self.transcript.persisted().len()));
                print_system(&format!(
                    "Directory: {}",
                    self.turn_loop.context().cwd.display()
                ));
            }
            ControlAction::Sessions => match self.store.list() {
                Ok(sessions) if sessions.is_empty() => print_system("No saved sessions"),
                Ok(sessions) => {
                    for summary in &sessions {
                        println!("{}", format_session(summary));
                    }
                }
                Err(e) => print_error(&e.to_string()),
            },
            ControlAction::Artifacts => {
                let session = self.turn_loop.session();
                match self
                    .artifacts
                    .list_filenames(&session.app, &session.user, &session.id)
                    .await
                {
                    Ok(names) if names.is_empty() => print_system("No artifacts yet"),
                    Ok(names) => {
                        for name in names {
                            println!("{}", name);
                        }
                    }
                    Err(e) => print_error(&e.to_string()),
                }
            }
            ControlAction::Exit => {}
        }
    }
}

fn show(message: &Message) {
    if let Some(text) = render(message) {
        println!("{}", text);
    }
}
