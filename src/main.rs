mod config;
mod data;
mod engine;
mod error;
mod ml;
mod tracking;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{PipelineConfig, DEFAULT_CONFIG_PATH};
use crate::engine::{default_model_path, default_output_path, run_prediction, run_training};

#[derive(Parser)]
#[command(name = "mlpipe")]
#[command(version)]
#[command(about = "Reproducible tabular ML pipeline: train, evaluate, version and track models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model, persist it under a timestamped directory and record the run
    Train {
        /// Pipeline configuration file (YAML, TOML or JSON)
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Score a sample table with a persisted model
    Predict {
        /// Model file written by `train`
        #[arg(long = "model_path", alias = "model-path")]
        model_path: Option<PathBuf>,
        /// CSV of feature rows; the built-in example rows are used when absent
        #[arg(long = "samples_file", alias = "samples-file")]
        samples_file: Option<PathBuf>,
        /// Where to write the `prediction` column
        #[arg(long = "output_csv", alias = "output-csv")]
        output_csv: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // a missing .env is fine
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json)?;

    info!("mlpipe v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Train { config } => train(&config).await?,
        Commands::Predict {
            model_path,
            samples_file,
            output_csv,
        } => {
            let model_path = model_path.unwrap_or_else(default_model_path);
            let output_csv = output_csv.unwrap_or_else(default_output_path);
            predict(&model_path, samples_file.as_deref(), &output_csv)?;
        }
    }

    Ok(())
}

async fn train(config_path: &Path) -> Result<()> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let source = data::source_for(&config.dataset);
    let tracker = tracking::sink_from_uri(&tracking::tracking_uri_from_env())?;

    let outcome = match run_training(&config, source.as_ref(), tracker.as_ref()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if e.is_config_error() {
                error!("Check the model settings in {}", config_path.display());
            } else if e.is_data_error() {
                error!("Check the dataset settings or the network connection");
            }
            return Err(e.into());
        }
    };

    info!("=== Training Summary ===");
    info!("Run: {} ({})", outcome.run_name, outcome.run_id);
    info!("Model: {} ({})", outcome.model_kind.long_name(), outcome.task);
    info!("Rows: {} train / {} test", outcome.train_rows, outcome.test_rows);
    for (name, value) in &outcome.metrics {
        info!("  {}: {:.4}", name, value);
    }
    info!("Artifacts: {}", outcome.run_dir.display());
    info!("Model file: {}", outcome.model_path.display());
    Ok(())
}

fn predict(model_path: &Path, samples_file: Option<&Path>, output_csv: &Path) -> Result<()> {
    let report = run_prediction(model_path, samples_file, output_csv)?;

    if let Some(run_dir) = &report.run_dir {
        info!("Model from run {}", run_dir.display());
    }
    if report.used_builtin_samples {
        info!("=== Predictions (built-in example rows) ===");
    } else {
        info!("=== Predictions ===");
    }
    for (i, p) in report.predictions.iter().enumerate() {
        info!("  row {}: {:.4}", i, p);
    }
    info!("Saved to {}", report.output_csv.display());
    Ok(())
}
