//! genomic-data-cli
//!
//! Command-line interface for loading windows of genomic data through configured tracks.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "genomic-data-cli")]
#[command(author, version, about = "Load genomic interval data from configured tracks")]
#[command(
    long_about = "Load sequence, numeric and region data from configured tracks.

Examples:
  genomic-data-cli list -c tracks.xml
  genomic-data-cli fetch -c tracks.xml -t genes --organism 9606 --build hg38 chr1:11000-12000
  genomic-data-cli protocols"
)]
struct Cli {
    /// Log filter (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load one window of a track
    Fetch {
        /// Track configuration file (XML)
        #[arg(short, long)]
        config: PathBuf,

        /// Loader settings file (TOML)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Track name
        #[arg(short, long)]
        track: String,

        /// NCBI taxonomy id of the organism
        #[arg(long, default_value = "9606")]
        organism: i32,

        /// Genome build
        #[arg(long)]
        build: String,

        /// Window as chromosome:start-end (1-based, inclusive)
        location: String,

        /// Output format
        #[arg(short = 'f', long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },

    /// List configured tracks and their sources
    List {
        /// Track configuration file (XML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List the supported source protocols
    Protocols,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", level, e))?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(&cli.log_level) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let result = match cli.command {
        Commands::Fetch {
            config,
            settings,
            track,
            organism,
            build,
            location,
            format,
        } => commands::fetch::handle_fetch(commands::fetch::FetchArgs {
            config,
            settings,
            track,
            organism,
            build,
            location,
            json: format == "json",
        }),
        Commands::List { config } => commands::tracks::handle_list(&config),
        Commands::Protocols => {
            commands::tracks::handle_protocols();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
