mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{SampleArgs, ScoreArgs, ScoreKind, TrainArgs};

/// jem: train, sample and score Joint Energy-Based Models.
#[derive(Parser)]
#[command(name = "jem", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for JEM training, SGLD sampling and scoring.
#[derive(Subcommand)]
enum Command {
    /// Train a JEM on a JSON dataset of labelled images.
    Train {
        /// Path to JEM config TOML file. Library defaults if omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSON array of `{pixels, label}` training records.
        #[arg(long)]
        train_data: PathBuf,
        /// JSON array of `{pixels, label}` validation records.
        #[arg(long)]
        val_data: Option<PathBuf>,
        /// Directory for checkpoints (overrides `[training].checkpoint_dir`).
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Warm-start from an existing checkpoint directory.
        #[arg(long)]
        resume_from: Option<PathBuf>,
        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override the batch size.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Seed for shuffling and sampler randomness.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run SGLD chains from a model and write intermediate frames as JSON.
    Sample {
        /// Path to JEM config TOML file. Library defaults if omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Checkpoint directory. An untrained model is used if omitted.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Path for the output JSON file.
        #[arg(long)]
        output: PathBuf,
        /// Sample one chain per class instead of a single unconditional chain.
        #[arg(long)]
        conditional: bool,
        /// Classes to sample in conditional mode (e.g., "0,3,7"). Default: all.
        #[arg(long, value_delimiter = ',')]
        classes: Option<Vec<usize>>,
        /// Number of Langevin steps per chain.
        #[arg(long, default_value_t = 256)]
        steps: usize,
        /// Langevin step size.
        #[arg(long, default_value_t = 10.0)]
        step_size: f64,
        /// Chains run in parallel per class.
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        /// Seed for sampler randomness.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Score images with a trained checkpoint.
    Score {
        /// Path to JEM config TOML file. Library defaults if omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Checkpoint directory.
        #[arg(long)]
        checkpoint: PathBuf,
        /// JSON array of images to score.
        #[arg(long)]
        input: PathBuf,
        /// JSON array of out-of-distribution images; reports AUROC against `--input`.
        #[arg(long)]
        ood: Option<PathBuf>,
        /// Score to report.
        #[arg(long, value_enum, default_value_t = ScoreKind::Px)]
        score: ScoreKind,
        /// Write the JSON report here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            train_data,
            val_data,
            checkpoint,
            resume_from,
            epochs,
            batch_size,
            seed,
        } => pipeline::run_train(TrainArgs {
            config,
            data: train_data,
            val_data,
            checkpoint_dir: checkpoint,
            resume_from,
            num_epochs: epochs,
            batch_size,
            seed,
        }),
        Command::Sample {
            config,
            checkpoint,
            output,
            conditional,
            classes,
            steps,
            step_size,
            batch_size,
            seed,
        } => pipeline::run_sample(SampleArgs {
            config,
            checkpoint,
            output,
            conditional,
            classes,
            steps,
            step_size,
            batch_size,
            seed,
        }),
        Command::Score {
            config,
            checkpoint,
            input,
            ood,
            score,
            output,
        } => pipeline::run_score(ScoreArgs {
            config,
            checkpoint,
            input,
            ood,
            kind: score,
            output,
        }),
    }
}
