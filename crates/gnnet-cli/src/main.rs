mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::TrainOverrides;
use pipeline::{SummaryArgs, TrainArgs};

/// gnnet: multi-level triplet + Gauss-Newton correspondence training.
#[derive(Parser)]
#[command(name = "gnnet", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for training and inspecting runs.
#[derive(Subcommand)]
enum Command {
    /// Train the feature pyramid on synthetic correspondence pairs.
    Train {
        /// Path to train config TOML file.
        #[arg(long, default_value = "configs/train.toml")]
        config: PathBuf,
        /// Override the checkpoint directory.
        #[arg(long)]
        save_root: Option<PathBuf>,
        /// Override the scalar/plot directory.
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Resume from a checkpoint directory (e.g. checkpoints/gnnet/epoch_4).
        #[arg(long)]
        resume_from: Option<PathBuf>,
        /// First epoch of a fresh run. Resumed runs continue after their checkpoint.
        #[arg(long, conflicts_with = "resume_from")]
        start_epoch: Option<usize>,
        /// Override the total number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override the initial learning rate (ignored on resume).
        #[arg(long)]
        lr: Option<f64>,
        /// Override the batch size.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Train on every pair and skip validation.
        #[arg(long)]
        no_validation: bool,
        /// Hide progress bars.
        #[arg(long)]
        no_progress: bool,
    },
    /// Print the loss history and best epochs of a run.
    Summary {
        /// Directory holding scalars.jsonl.
        #[arg(long, default_value = "runs/gnnet")]
        log_dir: PathBuf,
        /// Directory holding best.txt.
        #[arg(long, default_value = "checkpoints/gnnet")]
        save_root: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            save_root,
            log_dir,
            resume_from,
            start_epoch,
            epochs,
            lr,
            batch_size,
            no_validation,
            no_progress,
        } => pipeline::run_train(TrainArgs {
            config,
            overrides: TrainOverrides {
                save_root,
                log_dir,
                epochs,
                lr,
                batch_size,
                no_validation,
                no_progress,
            },
            resume_from,
            start_epoch,
        }),
        Command::Summary { log_dir, save_root } => {
            pipeline::run_summary(SummaryArgs { log_dir, save_root })
        }
    }
}
