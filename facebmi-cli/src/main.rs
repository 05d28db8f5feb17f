//! facebmi CLI: staged fine-tuning and held-out evaluation.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// facebmi: fine-tune and evaluate face-image BMI regressors
#[derive(Parser, Debug)]
#[command(name = "facebmi", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (searched for facebmi.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Additional configuration file layered over the workspace config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the fine-tuning phases for one model and cutoff
    Train {
        /// Name used as the prefix of weight and log paths
        #[arg(long)]
        model_name: String,

        /// Selects training_samples_<cutoff>_cutoff.csv
        #[arg(long)]
        cutoff: String,

        /// Which phases to run
        #[arg(long, value_enum, default_value_t = PhaseArg::Both)]
        phase: PhaseArg,

        /// Start from these weights instead of a fresh initialisation
        #[arg(long)]
        init_weights: Option<PathBuf>,

        /// Base seed for the per-epoch shuffle
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Skip the held-out evaluation after training
        #[arg(long)]
        skip_eval: bool,

        #[command(flatten)]
        model: ModelArgs,
    },
    /// Score saved weights on the held-out slice of the info file
    Evaluate {
        /// Weights file written by a training phase
        #[arg(long)]
        weights: PathBuf,

        #[command(flatten)]
        model: ModelArgs,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PhaseArg {
    Top,
    All,
    Both,
}

/// Shape of the reference model.
#[derive(clap::Args, Debug, Clone)]
struct ModelArgs {
    /// Pooling grid edge
    #[arg(long, default_value_t = 4)]
    grid: usize,

    /// Width of the dense backbone layer
    #[arg(long, default_value_t = 32)]
    hidden: usize,

    /// Weight initialisation seed
    #[arg(long, default_value_t = 42)]
    init_seed: u64,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default facebmi.toml into the workspace
    Init,
    /// Show the effective configuration
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
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "facebmi", "facebmi")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "facebmi.log");
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
        .unwrap_or_else(|_| cli.workspace.clone());

    commands::handle_command(cli.command, &workspace, cli.config.as_deref())
}
