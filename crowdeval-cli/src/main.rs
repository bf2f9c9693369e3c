//! crowdeval CLI — train and evaluate Korean seq2seq models on crowd monitoring data.

mod commands;

use clap::Parser;
use crowdeval_core::{ModelFamily, PipelineError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// crowdeval: fine-tuning and evaluation harness for FlanT5, KoBART and PKO-T5
#[derive(Parser, Debug)]
#[command(name = "crowdeval", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override a config value, e.g. `--set training.epochs=3` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Increase verbosity (-v, -vv, -vvv)
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
    /// Fine-tune a model family on a dataset
    Train {
        /// Model family: flant5, kobart or pko-t5
        family: ModelFamily,
        /// Dataset files (CSV, TSV, JSON, JSONL); defaults to data.paths
        data: Vec<PathBuf>,
        /// Pretrained checkpoint id or local checkpoint directory
        #[arg(long)]
        base_checkpoint: Option<String>,
        /// Number of epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Root directory for run outputs
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Evaluate a fine-tuned checkpoint on the held-out split
    Evaluate {
        /// Model family: flant5, kobart or pko-t5
        family: ModelFamily,
        /// Checkpoint directory produced by `train`
        checkpoint: String,
        /// Dataset files; defaults to data.paths
        data: Vec<PathBuf>,
        /// Beam count (1 = greedy)
        #[arg(long)]
        beams: Option<usize>,
        /// Maximum number of evaluated examples
        #[arg(long)]
        max_samples: Option<usize>,
        /// Report path (must not exist yet)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate a guideline-conformant synthetic dataset
    Synth {
        /// Output file; the extension picks the format
        output: PathBuf,
        /// Number of examples
        #[arg(short = 'n', long, default_value = "1000")]
        count: usize,
        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Write the legacy Input/Output/Domain columns
        #[arg(long)]
        legacy: bool,
        /// Domain label
        #[arg(long)]
        domain: Option<String>,
    },
    /// Check a dataset against the authoring guidelines
    Validate {
        /// Dataset files; defaults to data.paths
        data: Vec<PathBuf>,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Tabulate evaluation reports side by side
    Compare {
        /// Evaluation report files
        #[arg(required = true)]
        reports: Vec<PathBuf>,
        /// Print the comparison as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
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
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "crowdeval", "crowdeval")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "crowdeval.log");
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

    match commands::handle_command(cli.command, &workspace, cli.config.as_deref(), &cli.overrides).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// 2 data format, 3 model load, 4 resource exhausted, 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map_or(1, PipelineError::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_train() {
        let cli = Cli::parse_from([
            "crowdeval", "-v", "--set", "training.seed=7", "train", "kobart", "a.csv", "b.csv", "--epochs", "2",
        ]);
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.overrides, vec!["training.seed=7".to_string()]);
        match cli.command {
            Commands::Train { family, data, epochs, .. } => {
                assert_eq!(family, ModelFamily::KoBart);
                assert_eq!(data.len(), 2);
                assert_eq!(epochs, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_family_is_rejected() {
        assert!(Cli::try_parse_from(["crowdeval", "train", "gpt2"]).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        let err = anyhow::Error::new(PipelineError::data_format("x.csv#3", "missing field"));
        assert_eq!(exit_code(&err), 2);
        let err = anyhow::Error::new(PipelineError::model_load("bad")).context("evaluate failed");
        assert_eq!(exit_code(&err), 3);
        let err = anyhow::Error::new(PipelineError::resource_exhausted("oom"));
        assert_eq!(exit_code(&err), 4);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
