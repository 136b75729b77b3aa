//! Checkpoint persistence: model weights, optimizer state, scheduler state and
//! best-loss metadata in one directory per checkpoint.
//!
//! ```text
//! <root>/epoch_<epoch>/{model.mpk, optimizer.mpk, meta.json}   regular (epoch -1 = initial weights)
//! <root>/best/{model.mpk, optimizer.mpk, meta.json}            best validation loss so far
//! ```

use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::training::schedule::StepLr;

/// Metadata saved alongside each checkpoint for resuming training.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Epoch whose end state was saved; -1 for the initial weights.
    pub epoch: i64,
    pub is_best: bool,
    /// Best validation total seen so far; `None` while still unset.
    pub best_loss: Option<f64>,
    pub scheduler: StepLr,
}

/// Borrowed view of everything a checkpoint persists.
pub struct Checkpoint<'a, M, O> {
    pub epoch: i64,
    pub model: &'a M,
    pub optimizer: &'a O,
    pub scheduler: &'a StepLr,
    pub best_loss: f64,
    pub is_best: bool,
}

/// Destination for checkpoints written by the supervisor.
pub trait CheckpointStore<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn save(&mut self, checkpoint: Checkpoint<'_, M, O>) -> Result<()>;
}

/// Writes checkpoints below a root directory with burn's named MessagePack
/// recorder.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a checkpoint for `epoch` lands in.
    pub fn dir_for(&self, epoch: i64, is_best: bool) -> PathBuf {
        if is_best {
            self.root.join("best")
        } else {
            self.root.join(format!("epoch_{epoch}"))
        }
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

impl<B, M, O> CheckpointStore<B, M, O> for FileCheckpointStore
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn save(&mut self, checkpoint: Checkpoint<'_, M, O>) -> Result<()> {
        let dir = self.dir_for(checkpoint.epoch, checkpoint.is_best);
        std::fs::create_dir_all(&dir)?;
        let recorder = recorder();

        checkpoint
            .model
            .clone()
            .save_file(dir.join("model"), &recorder)
            .map_err(|e| {
                TrainError::Checkpoint(format!("failed to save model to {}: {e}", dir.display()))
            })?;

        Recorder::<B>::record(&recorder, checkpoint.optimizer.to_record(), dir.join("optimizer"))
            .map_err(|e| {
                TrainError::Checkpoint(format!(
                    "failed to save optimizer to {}: {e}",
                    dir.display()
                ))
            })?;

        let meta = CheckpointMeta {
            epoch: checkpoint.epoch,
            is_best: checkpoint.is_best,
            best_loss: checkpoint.best_loss.is_finite().then_some(checkpoint.best_loss),
            scheduler: checkpoint.scheduler.clone(),
        };
        serde_json::to_writer_pretty(std::fs::File::create(dir.join("meta.json"))?, &meta)?;

        tracing::debug!(
            epoch = checkpoint.epoch,
            is_best = checkpoint.is_best,
            dir = %dir.display(),
            "Checkpoint saved (model + optimizer + meta)"
        );
        Ok(())
    }
}

/// State recovered from a checkpoint directory.
#[derive(Debug)]
pub struct ResumedState<M, O> {
    pub model: M,
    pub optimizer: O,
    pub scheduler: StepLr,
    /// Epoch the checkpoint was taken after; training continues at `epoch + 1`.
    pub epoch: i64,
    /// `f64::INFINITY` when no validation loss had been recorded.
    pub best_loss: f64,
}

/// Read only the metadata of a checkpoint.
pub fn read_meta(dir: &Path) -> Result<CheckpointMeta> {
    let path = dir.join("meta.json");
    let file = std::fs::File::open(&path).map_err(|e| {
        TrainError::Checkpoint(format!("failed to open {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Load model weights, optimizer state and scheduler state from `dir` on top
/// of freshly constructed `model` and `optimizer`.
pub fn load_checkpoint<B, M, O>(
    dir: &Path,
    model: M,
    optimizer: O,
    device: &B::Device,
) -> Result<ResumedState<M, O>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let meta = read_meta(dir)?;
    let recorder = recorder();

    let model = model
        .load_file(dir.join("model"), &recorder, device)
        .map_err(|e| {
            TrainError::Checkpoint(format!("failed to load model from {}: {e}", dir.display()))
        })?;

    let record: O::Record = Recorder::<B>::load(&recorder, dir.join("optimizer"), device)
        .map_err(|e| {
            TrainError::Checkpoint(format!(
                "failed to load optimizer from {}: {e}",
                dir.display()
            ))
        })?;
    let optimizer = optimizer.load_record(record);

    tracing::info!(
        epoch = meta.epoch,
        best_loss = ?meta.best_loss,
        lr = meta.scheduler.lr(),
        "Restored checkpoint"
    );

    Ok(ResumedState {
        model,
        optimizer,
        scheduler: meta.scheduler,
        epoch: meta.epoch,
        best_loss: meta.best_loss.unwrap_or(f64::INFINITY),
    })
}
