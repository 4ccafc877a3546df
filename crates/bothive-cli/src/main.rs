//! bothive - operator CLI for the bot-instance orchestrator.
//!
//! Thin front-end over [`bothive_core::Orchestrator`]: loads the TOML
//! config, wires the production capability implementations (pm2-style
//! supervisor driver, `SQLite` registry, kernel socket-table prober), and
//! exposes the orchestrator's operations as subcommands.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bothive_core::{
    CommandSupervisor, NetstatProber, Orchestrator, OrchestratorConfig, SqliteRegistry,
};

#[derive(Parser)]
#[command(name = "bothive", about = "Bot-instance orchestrator", version)]
struct Cli {
    /// Path to the orchestrator config file.
    #[arg(long, global = true, default_value = "bothive.toml")]
    config: PathBuf,

    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn a bot instance for an identity.
    Spawn {
        /// Owner identity (wallet address).
        identity: String,
        /// Deployment target.
        #[arg(long, default_value = "testnet")]
        network: String,
        /// Environment variable holding the credential. The key never
        /// travels on the command line.
        #[arg(long, default_value = "BOTHIVE_SECRET")]
        secret_env: String,
        /// Extra trading parameters as KEY=value pairs, passed through to
        /// the bot process environment.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// List known instances with their effective status.
    List {
        /// Only instances owned by this identity.
        identity: Option<String>,
    },
    /// Stop an instance by instance id or identity.
    Stop {
        /// Instance id or owner identity.
        target: String,
    },
    /// Force cleanup of everything attributable to an identity.
    Cleanup {
        /// Owner identity.
        identity: String,
        /// Also delete supervisor processes with a confirmed tag match
        /// that no local or durable record tracks.
        #[arg(long)]
        deep: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn build_orchestrator(config_path: &PathBuf) -> anyhow::Result<Orchestrator> {
    let config = OrchestratorConfig::from_file(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    tracing::debug!(
        min_port = config.min_port,
        max_port = config.max_port,
        supervisor = %config.supervisor.program,
        "orchestrator config loaded"
    );

    let supervisor = Arc::new(CommandSupervisor::new(
        config.supervisor.program.clone(),
        config.supervisor_timeout(),
    ));
    let registry = Arc::new(
        SqliteRegistry::open(&config.registry_path).context("opening instance registry")?,
    );
    let prober = Arc::new(NetstatProber::new());

    Ok(Orchestrator::new(config, supervisor, registry, prober))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let orchestrator = build_orchestrator(&cli.config)?;

    match cli.command {
        Command::Spawn {
            identity,
            network,
            secret_env,
            params,
        } => commands::spawn(&orchestrator, &identity, &network, &secret_env, &params, cli.json).await,
        Command::List { identity } => commands::list(&orchestrator, identity.as_deref(), cli.json),
        Command::Stop { target } => commands::stop(&orchestrator, &target, cli.json).await,
        Command::Cleanup { identity, deep } => {
            commands::cleanup(&orchestrator, &identity, deep, cli.json).await
        }
    }
}
