mod cmd;

use clap::{Parser, Subcommand};
use std::process;

use phi_worker::{logging, WorkerConfig};

#[derive(Parser)]
#[command(name = "phi-worker")]
#[command(version = "0.5.0")]
#[command(about = "Load a language model and stream tokens to a host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak the worker protocol over stdin/stdout
    Serve,
    /// Inspect or empty the asset cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Download assets into the cache
    Fetch {
        #[arg(required = true)]
        urls: Vec<String>,
        #[arg(short, long)]
        label: Option<String>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    Status,
    #[command(alias = "rm")]
    Clear,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let config = WorkerConfig::from_env();

    let result = match cli.command {
        Commands::Serve => cmd::serve(config).await,
        Commands::Cache { action: CacheAction::Status } => cmd::cache_status(config).await,
        Commands::Cache { action: CacheAction::Clear } => cmd::cache_clear(config).await,
        Commands::Fetch { urls, label } => cmd::fetch(config, urls, label).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
