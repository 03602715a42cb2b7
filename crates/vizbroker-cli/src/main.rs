//! vizbroker CLI
//!
//! Command-line interface for interacting with the vizbroker daemon.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// vizbroker - allocate visualization resources from a cluster
#[derive(Parser, Debug)]
#[command(name = "vizbroker")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9191", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate the resources described in a JSON request file
    Allocate {
        /// Request file holding a list of request items
        file: PathBuf,

        /// User id to allocate for
        #[arg(long)]
        user: u32,

        /// Group id to allocate for
        #[arg(long, default_value_t = 0)]
        group: u32,

        /// Only use these nodes (repeatable)
        #[arg(long = "include")]
        include: Vec<String>,
    },

    /// Release an allocation
    Release {
        /// Allocation ID
        id: Uuid,
    },

    /// List allocations, or show one
    Allocations {
        /// Allocation ID (optional, lists all if not provided)
        id: Option<Uuid>,
    },

    /// List resources and their owners
    Resources,

    /// List nodes
    Nodes,

    /// Show broker status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Allocate {
            file,
            user,
            group,
            include,
        } => {
            commands::allocate(&client, &file, user, group, include).await?;
        }
        Commands::Release { id } => {
            commands::release(&client, id).await?;
        }
        Commands::Allocations { id } => {
            commands::allocations(&client, id).await?;
        }
        Commands::Resources => {
            commands::resources(&client).await?;
        }
        Commands::Nodes => {
            commands::nodes(&client).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
    }

    Ok(())
}
