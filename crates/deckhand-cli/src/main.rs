//! Deckhand CLI - deploy and manage services on a single host.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use deckhand_control::DeckhandConfig;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use commands::deploy::DeployArgs;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(about = "Deploy, upgrade and remove services on this host")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $DECKHAND_CONFIG or /etc/deckhand/deckhand.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create directories and a starter config, or check an existing setup
    Init,

    /// Deploy a new service from a GitHub release
    Deploy(DeployArgs),

    /// Move a service to another release, rolling back if it fails to come up
    Upgrade {
        /// Service name
        name: String,

        /// Release tag (defaults to the latest release)
        #[arg(short, long)]
        version: Option<String>,
    },

    /// Swap a service back to its previous version
    Rollback {
        /// Service name
        name: String,
    },

    /// Stop a service and remove everything deckhand created for it
    Remove {
        /// Service name
        name: String,

        /// Also drop the service's database and user
        #[arg(long)]
        drop_database: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List deployed services
    List,

    /// Show a service and whether it is running
    Status {
        /// Service name
        name: String,
    },

    /// Print a service's unit, proxy config and secrets (redacted)
    Inspect {
        /// Service name
        name: String,
    },

    /// Show a service's deploy history, newest first
    History {
        /// Service name
        name: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DeckhandConfig> {
    let config = match path {
        Some(path) => DeckhandConfig::from_file(path)?,
        None => DeckhandConfig::load()?,
    };
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("deckhand=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; stopping after the current step");
            on_interrupt.cancel();
        }
    });

    let result = run(cli, cancel).await;

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::Init) {
        let path = cli.config.unwrap_or_else(DeckhandConfig::default_path);
        return commands::init::run(&path).await;
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Deploy(args) => commands::deploy::run(&config, cancel, args).await,
        Commands::Upgrade { name, version } => {
            commands::upgrade::run(&config, cancel, name, version).await
        }
        Commands::Rollback { name } => commands::rollback::run(&config, cancel, &name).await,
        Commands::Remove {
            name,
            drop_database,
            yes,
        } => commands::remove::run(&config, cancel, name, drop_database, yes).await,
        Commands::List => commands::inspect::list(&config).await,
        Commands::Status { name } => commands::inspect::status(&config, cancel, &name).await,
        Commands::Inspect { name } => commands::inspect::inspect(&config, &name).await,
        Commands::History { name } => commands::inspect::history(&config, &name).await,
    }
}
