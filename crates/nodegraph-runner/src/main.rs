use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "nodegraph")]
#[command(about = "Build a weighted knowledge graph from text and query it", long_about = None)]
struct Cli {
    /// Cache directory (overrides NODEGRAPH_CACHE_DIR)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose pending text units and grow the graph
    Build,

    /// Replay the LLM failure cache, then build
    Rerun,

    /// Embed entity records into the vector index
    Index,

    /// Retrieve ranked graph nodes for a query
    Search {
        query: String,

        /// Vector hits used as seeds
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Store an answered question for later searches
    Remember { question: String, answer: String },

    /// Print graph statistics
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "nodegraph=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = match nodegraph_core::AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Build => commands::build(&config, false).await,
        Commands::Rerun => commands::build(&config, true).await,
        Commands::Index => commands::index(&config).await,
        Commands::Search { query, top_k } => {
            commands::search(&config, &query, top_k.unwrap_or(config.retrieval.top_k), cli.json).await
        }
        Commands::Remember { question, answer } => commands::remember(&config, &question, &answer).await,
        Commands::Stats => commands::stats(&config, cli.json).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}
