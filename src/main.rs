//! popper CLI
//!
//! Evidence-gated hypothesis testing with a tool-using model.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use popper::backend::create_backend;
use popper::hooks::{CommandHooks, DenyAll, PermissionPrompter};
use popper::interactive::{
    format_session, install_panic_handler, ChatSession, SignalHandler, TerminalInput,
    TerminalPermissions, TerminalPrompter,
};
use popper::retry::StagePolicy;
use popper::tools::{NoPrompter, StageServices, ToolRegistry, ToolRunner, ToolUseContext, UserPrompter};
use popper::transcript::TranscriptStore;
use popper::{
    AbortScope, ArtifactKey, ArtifactStore, Config, FileArtifactStore, SessionContext, Transcript,
    TurnLoop,
};

#[derive(Parser)]
#[command(name = "popper")]
#[command(author, version, about = "Evidence-gated hypothesis testing")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "POPPER_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive session
    #[command(alias = "i")]
    Chat {
        /// Continue a saved session
        #[arg(long)]
        resume: Option<String>,
    },

    /// Run a single turn and print the answer
    Ask {
        prompt: String,

        /// Append to a saved session instead of starting one
        #[arg(long)]
        session: Option<String>,
    },

    /// List saved sessions
    Sessions,

    /// Inspect stage artifacts
    Artifacts {
        #[command(subcommand)]
        action: ArtifactCommands,
    },

    /// Initialize .popper directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// List artifact filenames of a session
    List {
        #[arg(long)]
        session: String,
    },

    /// Print an artifact
    #[command(disable_version_flag = true)]
    Show {
        #[arg(long)]
        session: String,
        filename: String,
        /// Version to show (latest by default)
        #[arg(long)]
        version: Option<u32>,
    },

    /// List stored versions of an artifact
    Versions {
        #[arg(long)]
        session: String,
        filename: String,
    },

    /// Delete every version of an artifact
    Delete {
        #[arg(long)]
        session: String,
        filename: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Chat { resume } => chat(&config, resume).await?,
        Commands::Ask { prompt, session } => ask(&config, &prompt, session).await?,
        Commands::Sessions => {
            let sessions = TranscriptStore::new(config.session_dir())
                .list()
                .context("listing sessions")?;
            if sessions.is_empty() {
                println!("No saved sessions");
            }
            for summary in &sessions {
                println!("{}", format_session(summary));
            }
        }
        Commands::Artifacts { action } => handle_artifact_command(action, &config).await?,
        Commands::Init { force } => {
            let path = popper::config::init(force).context("initializing .popper")?;
            info!("Initialized .popper directory");
            println!("Config written to {}", path.display());
        }
        Commands::Config => {
            let rendered = toml::to_string_pretty(&config).context("serializing config")?;
            println!("{}", rendered);
        }
    }

    Ok(())
}

/// Wire backend, stage tools, hooks and session into a turn loop
fn build_turn_loop(
    config: &Config,
    session_id: &str,
    artifacts: Arc<dyn ArtifactStore>,
    prompter: Arc<dyn UserPrompter>,
    permissions: Arc<dyn PermissionPrompter>,
) -> anyhow::Result<TurnLoop> {
    let slot = Arc::new(create_backend(&config.backend).context("creating model backend")?);
    let services = Arc::new(StageServices::new(
        slot.clone(),
        StagePolicy::from_config(&config.retry, &config.budget),
        artifacts,
    ));
    let registry = Arc::new(ToolRegistry::with_builtins(config, services, prompter));
    let runner = ToolRunner::new(registry)
        .with_hooks(Arc::new(CommandHooks::new(&config.hooks)))
        .with_permissions(permissions);
    let session = Arc::new(SessionContext::from_config(session_id, config));

    Ok(TurnLoop::new(slot, Arc::new(runner), session, config)
        .with_context(ToolUseContext::current_dir()?))
}

fn open_transcript(store: &TranscriptStore, id: Option<String>) -> anyhow::Result<Transcript> {
    match id {
        Some(id) => store
            .load(&id)
            .with_context(|| format!("loading session {}", id)),
        None => Ok(Transcript::with_id(&Uuid::new_v4().to_string())),
    }
}

async fn chat(config: &Config, resume: Option<String>) -> anyhow::Result<()> {
    install_panic_handler();

    let store = TranscriptStore::new(config.session_dir());
    let transcript = open_transcript(&store, resume)?;
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(FileArtifactStore::new(config.artifact_dir()));
    let input = TerminalInput::stdin();

    let turn_loop = build_turn_loop(
        config,
        &transcript.id,
        artifacts.clone(),
        Arc::new(TerminalPrompter::new(input.clone())),
        Arc::new(TerminalPermissions::new(input.clone())),
    )?;

    let signals = SignalHandler::new();
    signals.install()?;

    let mut session =
        ChatSession::new(turn_loop, transcript, store, artifacts, input).with_signals(signals);
    session.run().await?;
    Ok(())
}

async fn ask(config: &Config, prompt: &str, session: Option<String>) -> anyhow::Result<()> {
    let store = TranscriptStore::new(config.session_dir());
    let mut transcript = open_transcript(&store, session)?;
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(FileArtifactStore::new(config.artifact_dir()));

    // Nobody is at the terminal to answer questions or approve tools
    let mut turn_loop = build_turn_loop(
        config,
        &transcript.id,
        artifacts,
        Arc::new(NoPrompter),
        Arc::new(DenyAll),
    )?;

    let outcome = turn_loop
        .run_turn(&mut transcript, prompt, &AbortScope::new())
        .await;
    store.save(&transcript).context("saving session")?;

    println!("{}", outcome.final_text);
    info!("Session {} ({} model calls)", transcript.id, outcome.model_calls);
    if !outcome.is_completed() {
        bail!("turn ended: {}", outcome.stop);
    }
    Ok(())
}

async fn handle_artifact_command(action: ArtifactCommands, config: &Config) -> anyhow::Result<()> {
    let store = FileArtifactStore::new(config.artifact_dir());
    let app = &config.artifacts.app_name;
    let user = &config.sessions.user;

    match action {
        ArtifactCommands::List { session } => {
            let names = store.list_filenames(app, user, &session).await?;
            if names.is_empty() {
                println!("No artifacts for session {}", session);
            }
            for name in names {
                println!("{}", name);
            }
        }
        ArtifactCommands::Show {
            session,
            filename,
            version,
        } => {
            let key = ArtifactKey::new(app, user, &session, &filename)?;
            match store.load(&key, version).await? {
                Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
                None => bail!("artifact not found: {}", key),
            }
        }
        ArtifactCommands::Versions { session, filename } => {
            let key = ArtifactKey::new(app, user, &session, &filename)?;
            let versions = store.list_versions(&key).await?;
            if versions.is_empty() {
                bail!("artifact not found: {}", key);
            }
            for version in versions {
                println!("{}", version);
            }
        }
        ArtifactCommands::Delete { session, filename } => {
            let key = ArtifactKey::new(app, user, &session, &filename)?;
            if store.delete(&key).await? {
                println!("Deleted {}", key);
            } else {
                bail!("artifact not found: {}", key);
            }
        }
    }
    Ok(())
}
