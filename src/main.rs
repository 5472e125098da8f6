use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use windlass::config::EngineConfig;
use windlass::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "windlass")]
#[command(version, about = "Declarative cascade engine for LLM workflows")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to windlass.toml (defaults to ./windlass.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "compact", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a cascade and check its structure and routing graph
    Validate {
        /// Cascade definition (.json, .yaml or .yml)
        cascade: PathBuf,
    },
    /// Print the species hash of each phase
    Species {
        cascade: PathBuf,
        /// Only this phase
        #[arg(short, long)]
        phase: Option<String>,
    },
    /// List recorded winning rewrites for a species
    Winners {
        species: String,
        /// Number of entries to show, newest first
        #[arg(short, default_value = "5")]
        k: usize,
    },
    /// Summarise a JSONL execution trace
    Trace {
        file: PathBuf,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.verbose);
    let config = EngineConfig::load_layered(cli.config.as_deref())?;

    match &cli.command {
        Commands::Validate { cascade } => cmd::cmd_validate(cascade)?,
        Commands::Species { cascade, phase } => cmd::cmd_species(cascade, phase.as_deref())?,
        Commands::Winners { species, k } => cmd::cmd_winners(&config, species, *k)?,
        Commands::Trace { file } => cmd::cmd_trace(file)?,
        Commands::Config { command } => cmd::cmd_config(&config, cli.config.as_deref(), command.clone())?,
    }

    Ok(())
}
