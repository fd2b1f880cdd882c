//! Strata CLI - incremental parallel parsing of source trees.
//!
//! # Usage
//!
//! ```bash
//! # Analyze a project, exporting the module graph
//! strata run ./src --output graph.jsonl
//!
//! # Inspect and maintain the cache
//! strata cache stats
//! strata cache clean --max-age-days 7
//!
//! # Write the default configuration
//! strata config init
//! ```

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::RunOptions;
use output::OutputFormat;
use std::path::PathBuf;
use std::process;
use strata_core::{Strategy, StrataConfig};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - incremental parallel source analysis", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATA_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Output format (human, json)
    #[arg(long, global = true, default_value = "human")]
    format: OutputFormatArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormatArg {
    Human,
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Human => OutputFormat::Human,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    Pooled,
    CpuBound,
    Hybrid,
    Adaptive,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Pooled => Strategy::Pooled,
            StrategyArg::CpuBound => Strategy::CpuBound,
            StrategyArg::Hybrid => Strategy::Hybrid,
            StrategyArg::Adaptive => Strategy::Adaptive,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse files under the given paths, reusing cached results
    Run {
        /// Files or directories to analyze (default: current directory)
        paths: Vec<PathBuf>,

        /// Ignore and do not update the cache
        #[arg(long)]
        no_cache: bool,

        /// Parse on the calling thread only
        #[arg(long)]
        sequential: bool,

        /// Maximum number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Execution strategy
        #[arg(short, long)]
        strategy: Option<StrategyArg>,

        /// Write modules and relationships as JSON lines to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Cache management
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache location and size
    Stats,

    /// Remove entries older than the given age
    Clean {
        /// Maximum entry age in days (default: from configuration)
        #[arg(long)]
        max_age_days: Option<u64>,
    },

    /// Forget cached results for specific files
    Invalidate {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Remove every cached entry
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration file
    Init {
        /// Destination (default: user config directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        output::error(format!("{:#}", e));
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let format = OutputFormat::from(cli.format);
    let load_config = || StrataConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Run {
            paths,
            no_cache,
            sequential,
            workers,
            strategy,
            output,
        } => {
            let options = RunOptions {
                paths,
                no_cache,
                sequential,
                workers,
                strategy: strategy.map(Strategy::from),
                output,
            };
            commands::run(load_config()?, options, format)?;
        }

        Commands::Cache(cmd) => {
            let config = load_config()?;
            match cmd {
                CacheCommands::Stats => commands::cache_stats(&config, format)?,
                CacheCommands::Clean { max_age_days } => commands::cache_clean(&config, max_age_days)?,
                CacheCommands::Invalidate { paths } => commands::cache_invalidate(&config, &paths)?,
                CacheCommands::Clear { yes } => commands::cache_clear(&config, yes)?,
            }
        }

        Commands::Config(ConfigCommands::Init { path, force }) => commands::config_init(path, force)?,
        Commands::Config(ConfigCommands::Show) => commands::config_show(&load_config()?, format)?,
    }

    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("strata=debug,strata_core=debug,strata_engine=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("strata=info,strata_core=info,strata_engine=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
