//! Watch a swarm execution from the terminal.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use swarm_sync_core::{
    AgentStatus, CanvasSink, Direction, GraphSnapshot, LayeredLayout, PromptRequest, SyncConfig,
};
use swarm_sync_session::{SyncManager, storage::MemoryStorage};

#[derive(Parser, Debug)]
#[command(name = "swarm-watch", about = "Follow a streamed swarm execution")]
struct Cli {
    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Event stream base URL (overrides config).
    #[arg(long)]
    ws_url: Option<String>,

    /// REST API base URL (overrides config).
    #[arg(long)]
    api_url: Option<String>,

    #[arg(long, value_enum)]
    direction: Option<LayoutDirection>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach to an existing execution.
    Watch {
        exec_id: String,
        /// Only receive events after the last delivered one.
        #[arg(long)]
        resume: bool,
    },
    /// Start a state-machine execution and follow it.
    Start {
        #[arg(long, default_value = "Untitled run")]
        title: String,
        /// JSON request body passed through to the backend.
        #[arg(long, default_value = "{}")]
        request: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LayoutDirection {
    Tb,
    Lr,
}

impl From<LayoutDirection> for Direction {
    fn from(d: LayoutDirection) -> Self {
        match d {
            LayoutDirection::Tb => Self::TopBottom,
            LayoutDirection::Lr => Self::LeftRight,
        }
    }
}

/// Prints canvas events as they arrive.
struct TerminalCanvas;

impl CanvasSink for TerminalCanvas {
    fn on_snapshot(&self, snapshot: GraphSnapshot) {
        let done = snapshot
            .nodes
            .iter()
            .filter(|n| n.data.status == AgentStatus::Completed)
            .count();
        println!(
            "graph: {} nodes ({done} completed), {} edges",
            snapshot.nodes.len(),
            snapshot.edges.len()
        );
        for node in &snapshot.nodes {
            let action = node.data.current_action.as_deref().unwrap_or("");
            let status = format!("{:?}", node.data.status);
            println!("  {:<24} {status:<12} {action}", node.id);
        }
    }

    fn on_focus_request(&self, node_id: &str) {
        println!("focus: {node_id}");
    }

    fn on_modal_request(&self, prompt: PromptRequest) {
        println!(
            "input needed at {}: {} {:?}",
            prompt.state_id,
            prompt.prompt.as_deref().unwrap_or("(no prompt)"),
            prompt.options
        );
    }

    fn on_error(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(url) = &cli.ws_url {
        config.ws_base_url.clone_from(url);
    }
    if let Some(url) = &cli.api_url {
        config.api_base_url.clone_from(url);
    }
    if let Some(direction) = cli.direction {
        config.direction = direction.into();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let config = load_config(&cli)?;

    let manager = SyncManager::new(config, MemoryStorage::new(), Arc::new(LayeredLayout::default()));
    let (exec_id, feed) = match &cli.command {
        Command::Watch { exec_id, resume } => {
            let feed = manager.watch(exec_id, *resume).await?;
            (exec_id.clone(), feed)
        }
        Command::Start { title, request } => {
            let request: serde_json::Value =
                serde_json::from_str(request).context("Request body is not valid JSON")?;
            manager.start(title, &request).await?
        }
    };

    tracing::info!(exec = %exec_id, "following execution, Ctrl-C to quit");
    let forwarder = Arc::clone(&feed).spawn_forwarder(TerminalCanvas);

    tokio::signal::ctrl_c().await?;
    manager.unwatch(&exec_id).await?;
    forwarder.abort();
    Ok(())
}
