//! `prism`: drives the formatters, the streaming engine and the TOON codec
//! from files.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::{Outcome, PluginAction, SyntheticAction, ToonAction};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prism", about = "Prism: AI response normalization and streaming")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "prism.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Postprocess a provider response body into TOON
    Format {
        /// Provider name (anthropic, openai, cerebras, synthetic)
        #[arg(short, long)]
        provider: String,
        /// Model name recorded in the output
        #[arg(short, long, default_value = "default")]
        model: String,
        /// Response body file
        file: PathBuf,
    },
    /// Transform a request body for a provider
    Preprocess {
        /// Provider name
        #[arg(short, long)]
        provider: String,
        /// Request JSON file
        file: PathBuf,
    },
    /// Feed a file through the streaming engine in chunks
    Stream {
        /// Provider name
        #[arg(short, long)]
        provider: String,
        /// Model name recorded in the output
        #[arg(short, long, default_value = "default")]
        model: String,
        /// Chunk size in bytes
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
        /// Response text file
        file: PathBuf,
    },
    /// Inspect TOON documents
    Toon {
        #[command(subcommand)]
        action: ToonCommand,
    },
    /// Synthetic traffic and diagnostics
    Synthetic {
        #[command(subcommand)]
        action: SyntheticCommand,
    },
    /// Inspect registered formatters
    Plugins {
        #[command(subcommand)]
        action: PluginCommand,
    },
}

#[derive(Subcommand)]
enum ToonCommand {
    /// Check section structure
    Validate {
        /// TOON file
        file: PathBuf,
    },
    /// Report section sizes
    Analyze {
        /// TOON file
        file: PathBuf,
    },
    /// Decode to JSON
    Parse {
        /// TOON file
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum SyntheticCommand {
    /// Print a provider-shaped response body
    Simulate {
        /// Provider whose body shape is imitated
        #[arg(short, long)]
        provider: String,
        /// Text placed in the body
        #[arg(long, default_value = "hello from prism")]
        content: String,
    },
    /// List test scenarios
    Scenarios,
    /// Time simulated responses per provider
    Benchmark {
        /// Runs per provider
        #[arg(short, long, default_value_t = 100)]
        iterations: usize,
    },
    /// Run thread-safety and format-compatibility checks
    Selftest,
}

#[derive(Subcommand)]
enum PluginCommand {
    /// List registered formatters
    List,
    /// Aggregate formatter health
    Health,
}

fn init_tracing(default_directive: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    init_tracing(&config.log_level, cli.json_logs);
    debug!(config = %cli.config.display(), "Configuration loaded");

    let outcome: Outcome = match cli.command {
        Commands::Format {
            provider,
            model,
            file,
        } => commands::format(&config, &provider, &model, &file)?,
        Commands::Preprocess { provider, file } => {
            commands::preprocess(&config, &provider, &file)?
        }
        Commands::Stream {
            provider,
            model,
            chunk_size,
            file,
        } => commands::stream(&config, &provider, &model, chunk_size, &file).await?,
        Commands::Toon { action } => match action {
            ToonCommand::Validate { file } => commands::toon(&config, ToonAction::Validate, &file)?,
            ToonCommand::Analyze { file } => commands::toon(&config, ToonAction::Analyze, &file)?,
            ToonCommand::Parse { file } => commands::toon(&config, ToonAction::Parse, &file)?,
        },
        Commands::Synthetic { action } => {
            let action = match action {
                SyntheticCommand::Simulate { provider, content } => {
                    SyntheticAction::Simulate { provider, content }
                }
                SyntheticCommand::Scenarios => SyntheticAction::Scenarios,
                SyntheticCommand::Benchmark { iterations } => {
                    SyntheticAction::Benchmark { iterations }
                }
                SyntheticCommand::Selftest => SyntheticAction::Selftest,
            };
            commands::synthetic(&config, &action)?
        }
        Commands::Plugins { action } => match action {
            PluginCommand::List => commands::plugins(&config, PluginAction::List)?,
            PluginCommand::Health => commands::plugins(&config, PluginAction::Health)?,
        },
    };

    if outcome.success {
        println!("{}", outcome.output);
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{}", outcome.output);
        Ok(ExitCode::FAILURE)
    }
}
