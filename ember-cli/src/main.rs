//! Ember CLI: fit and test models from the terminal.
//!
//! Trains the built-in `LinearRegression` on synthetic data with the full
//! callback stack, and evaluates saved checkpoints.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Ember: a training loop with lifecycle callbacks
#[derive(Parser, Debug)]
#[command(name = "ember", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Fit the reference model on synthetic data
    Fit(FitArgs),
    /// Restore a checkpoint and evaluate it on the test split
    Test(TestArgs),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct DataArgs {
    /// Number of synthetic samples
    #[arg(long, default_value = "256")]
    samples: usize,

    /// Seed for data, initialisation and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Mini-batch size
    #[arg(long, default_value = "16")]
    batch_size: usize,
}

#[derive(clap::Args, Debug, Clone)]
struct FitArgs {
    /// Maximum number of epochs
    #[arg(long)]
    max_epochs: Option<usize>,

    /// Root directory for logs and checkpoints
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Stop early when this metric stops improving
    #[arg(long, value_name = "MONITOR")]
    early_stop: Option<String>,

    /// Epochs without improvement before stopping
    #[arg(long, default_value = "3")]
    patience: usize,

    /// Print how often each lifecycle hook fired
    #[arg(long)]
    trace_hooks: bool,

    #[command(flatten)]
    data: DataArgs,
}

#[derive(clap::Args, Debug, Clone)]
struct TestArgs {
    /// Checkpoint file to restore
    #[arg(long)]
    checkpoint: PathBuf,

    #[command(flatten)]
    data: DataArgs,
}

#[derive(clap::Subcommand, Debug, Clone, Copy)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "ember", "ember")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "ember.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = match &cli.config {
        Some(path) => ember_core::config::load_config_file(path),
        None => ember_core::config::load_config(Some(&workspace), None),
    }
    .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    commands::handle_command(cli.command, config)
}
