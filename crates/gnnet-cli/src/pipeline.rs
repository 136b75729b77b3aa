//! Training pipeline and run inspection.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use burn::optim::AdamWConfig;
use burn::tensor::backend::AutodiffBackend;

use gnnet::model::pyramid::GnNet;
use gnnet::training::checkpoint::{load_checkpoint, FileCheckpointStore};
use gnnet::training::data::split_indices;
use gnnet::training::plot::LossHistory;
use gnnet::training::schedule::StepLr;
use gnnet::training::sink::{
    read_scalars, BestEpochLog, JsonlScalarSink, TRAIN_GN_LOSS, TRAIN_TOTAL_LOSS,
    TRAIN_TRIPLET_LOSS, VAL_GN_LOSS, VAL_TOTAL_LOSS, VAL_TRIPLET_LOSS,
};
use gnnet::training::supervisor::{Trainer, TrainingState};
use gnnet::training::synthetic::{PairDataset, PairLoader};

use crate::config::{TrainOverrides, TrainToml};

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the train config TOML file.
    pub config: PathBuf,
    /// CLI flags layered over the TOML file.
    pub overrides: TrainOverrides,
    /// Checkpoint directory to resume from.
    pub resume_from: Option<PathBuf>,
    /// First epoch of a fresh run; ignored when resuming.
    pub start_epoch: Option<usize>,
}

/// Arguments for the `summary` subcommand.
#[derive(Debug)]
pub struct SummaryArgs {
    /// Directory holding `scalars.jsonl`.
    pub log_dir: PathBuf,
    /// Directory holding `best.txt`.
    pub save_root: PathBuf,
}

/// Train on the backend selected at compile time.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    #[cfg(feature = "wgpu")]
    {
        use burn::backend::wgpu::{Wgpu, WgpuDevice};
        train_on::<burn::backend::Autodiff<Wgpu>>(args, WgpuDevice::default())
    }
    #[cfg(not(feature = "wgpu"))]
    {
        use burn::backend::ndarray::{NdArray, NdArrayDevice};
        train_on::<burn::backend::Autodiff<NdArray<f32>>>(args, NdArrayDevice::default())
    }
}

fn train_on<B: AutodiffBackend>(args: TrainArgs, device: B::Device) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Resolve config
    let mut toml = TrainToml::load(&args.config)?;
    toml.apply(&args.overrides);
    let save_root = toml.trainer.save_root.clone();
    let log_dir = toml.trainer.log_dir.clone();
    std::fs::create_dir_all(&save_root)
        .with_context(|| format!("failed to create {}", save_root.display()))?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    toml.dump(&log_dir.join("config.toml"))?;

    // 2. Data
    let dataset = Arc::new(PairDataset::generate(&toml.synthetic_config()));
    let val_fraction = if toml.trainer.validate {
        toml.data.val_fraction
    } else {
        0.0
    };
    let (train_idx, val_idx) = split_indices(dataset.len(), val_fraction, toml.data.split_seed);
    tracing::info!(
        train = train_idx.len(),
        val = val_idx.len(),
        batch_size = toml.data.batch_size,
        "Split dataset"
    );
    if train_idx.is_empty() {
        anyhow::bail!("training split is empty ({} pairs)", dataset.len());
    }
    let train_loader =
        PairLoader::<B>::new(dataset.clone(), train_idx, toml.data.batch_size, device.clone())
            .with_shuffle(toml.data.shuffle_seed);
    let val_loader = (!val_idx.is_empty()).then(|| {
        PairLoader::<B::InnerBackend>::new(
            dataset.clone(),
            val_idx,
            toml.data.batch_size,
            device.clone(),
        )
    });

    // 3. Model, optimizer, scheduler (or their checkpointed state)
    let model = toml.model_config().init::<B>(&device);
    let optimizer = AdamWConfig::new()
        .with_weight_decay(toml.optim.weight_decay as f32)
        .init::<B, GnNet<B>>();
    let state = match &args.resume_from {
        Some(dir) => {
            let resumed = load_checkpoint::<B, _, _>(dir, model, optimizer, &device)
                .with_context(|| format!("failed to resume from {}", dir.display()))?;
            tracing::info!(
                dir = %dir.display(),
                epoch = resumed.epoch,
                best_loss = resumed.best_loss,
                "Resumed from checkpoint"
            );
            TrainingState::from_resumed(resumed)
        }
        None => {
            let scheduler = StepLr::new(
                toml.optim.lr,
                toml.optim.scheduler_step_size,
                toml.optim.scheduler_gamma,
            );
            let state = TrainingState::new(model, optimizer, scheduler);
            match args.start_epoch {
                Some(epoch) => state.with_next_epoch(epoch),
                None => state,
            }
        }
    };

    // 4. Persistence
    let scalars_path = log_dir.join("scalars.jsonl");
    let sink = JsonlScalarSink::open(&scalars_path, Some(state.next_epoch as i64))?;
    let history = LossHistory::from_scalars(&read_scalars(&scalars_path)?, state.next_epoch as i64);
    let store = FileCheckpointStore::new(&save_root);

    // 5. Fit
    let loss = toml.loss_config().init();
    let mut trainer = Trainer::<B, _, _, _>::new(toml.trainer_config(), device, loss, store, sink)
        .with_history(history);
    let report = trainer.fit(state, &train_loader, val_loader.as_ref())?;

    // 6. Print summary
    let elapsed = start.elapsed();
    println!("\n--- Training Summary ---");
    println!("Epochs run: {}", report.epochs.len());
    if let Some(last) = report.epochs.last() {
        println!(
            "Last epoch: {} (train total {:.4}, lr {:.2e})",
            last.epoch, last.train.total, last.lr
        );
    }
    if report.state.best_loss.is_finite() {
        println!("Best val loss: {:.4}", report.state.best_loss);
    }
    println!("Best epochs: {:?}", report.best_epochs);
    println!("Checkpoints: {}", save_root.display());
    println!("Logs: {}", log_dir.display());
    println!("Elapsed: {:.1}s", elapsed.as_secs_f64());

    Ok(())
}

/// Print the logged loss history and best epochs of a run.
pub fn run_summary(args: SummaryArgs) -> anyhow::Result<()> {
    let scalars_path = args.log_dir.join("scalars.jsonl");
    let records = read_scalars(&scalars_path)
        .with_context(|| format!("failed to read {}", scalars_path.display()))?;
    let best = BestEpochLog::new(args.save_root.join("best.txt")).read()?;

    let columns = [
        TRAIN_TOTAL_LOSS,
        TRAIN_TRIPLET_LOSS,
        TRAIN_GN_LOSS,
        VAL_TOTAL_LOSS,
        VAL_TRIPLET_LOSS,
        VAL_GN_LOSS,
    ];
    let mut rows: BTreeMap<i64, [Option<f64>; 6]> = BTreeMap::new();
    for record in &records {
        if let Some(col) = columns.iter().position(|c| *c == record.tag) {
            rows.entry(record.epoch).or_default()[col] = Some(record.value);
        }
    }

    println!("--- Run Summary ---");
    println!("Scalars: {} ({} records)", scalars_path.display(), records.len());
    println!(
        "{:>6} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "epoch", "train", "triplet", "gn", "val", "triplet", "gn"
    );
    for (epoch, values) in &rows {
        let cells: Vec<String> = values
            .iter()
            .map(|v| v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}")))
            .collect();
        let marker = if usize::try_from(*epoch).is_ok_and(|e| best.contains(&e)) {
            " *"
        } else {
            ""
        };
        println!(
            "{epoch:>6} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}{marker}",
            cells[0], cells[1], cells[2], cells[3], cells[4], cells[5]
        );
    }
    println!("Best epochs: {best:?}");
    if let Some(&last_best) = best.last() {
        let val = rows.get(&(last_best as i64)).and_then(|r| r[3]);
        if let Some(val) = val {
            println!("Best val loss: {val:.4} (epoch {last_best})");
        }
    }

    Ok(())
}
