//! Training supervisor: the epoch loop around the runners.
//!
//! Per epoch: train, step the scheduler, optionally validate, track the best
//! validation loss, checkpoint, log scalars and redraw the loss plot.

use std::path::PathBuf;

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::model::PairModel;
use crate::training::checkpoint::{Checkpoint, CheckpointStore, ResumedState};
use crate::training::data::BatchSource;
use crate::training::loss::LossAggregator;
use crate::training::metrics::EpochMeans;
use crate::training::plot::{write_loss_plot, LossHistory};
use crate::training::runner::{EpochRunner, TrainRequest};
use crate::training::schedule::StepLr;
use crate::training::sink::{
    BestEpochLog, ScalarSink, TRAIN_GN_LOSS, TRAIN_TOTAL_LOSS, TRAIN_TRIPLET_LOSS, VAL_GN_LOSS,
    VAL_TOTAL_LOSS, VAL_TRIPLET_LOSS,
};

/// Epoch-loop settings.
#[derive(Config, Debug)]
pub struct TrainerConfig {
    /// Epochs `[start, total_epochs)` are run.
    #[config(default = 50)]
    pub total_epochs: usize,
    /// Validate when `epoch % validation_frequency == 0`; 0 disables validation.
    #[config(default = 1)]
    pub validation_frequency: usize,
    /// A new best is only checkpointed once `epoch + 1` reaches this.
    #[config(default = 20)]
    pub best_checkpoint_min_epochs: usize,
    /// Re-draw convolution weights before the first batch of epoch 0.
    #[config(default = false)]
    pub init_weights: bool,
    /// Save an `epoch_-1` checkpoint before training (skipped on resume).
    #[config(default = true)]
    pub save_initial_weights: bool,
    #[config(default = true)]
    pub show_progress: bool,
    /// Checkpoints and `best.txt`.
    #[config(default = "String::from(\"checkpoints/gnnet\")")]
    pub save_root: String,
    /// Scalars, loss plot and config dump.
    #[config(default = "String::from(\"runs/gnnet\")")]
    pub log_dir: String,
}

/// Where the supervisor currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingEpoch,
    Training,
    Validating,
    Checkpointing,
    Done,
}

/// Everything that carries over between epochs.
#[derive(Debug)]
pub struct TrainingState<M, O> {
    /// First epoch `fit` will run.
    pub next_epoch: usize,
    /// Lowest mean validation total so far, `INFINITY` before the first one.
    pub best_loss: f64,
    pub model: M,
    pub optimizer: O,
    pub scheduler: StepLr,
    /// Checkpoint epoch this state was restored from.
    pub resumed_from: Option<i64>,
}

impl<M, O> TrainingState<M, O> {
    pub fn new(model: M, optimizer: O, scheduler: StepLr) -> Self {
        Self {
            next_epoch: 0,
            best_loss: f64::INFINITY,
            model,
            optimizer,
            scheduler,
            resumed_from: None,
        }
    }

    /// Continue after the checkpointed epoch.
    pub fn from_resumed(resumed: ResumedState<M, O>) -> Self {
        Self {
            next_epoch: (resumed.epoch + 1).max(0) as usize,
            best_loss: resumed.best_loss,
            model: resumed.model,
            optimizer: resumed.optimizer,
            scheduler: resumed.scheduler,
            resumed_from: Some(resumed.epoch),
        }
    }

    pub fn with_next_epoch(mut self, epoch: usize) -> Self {
        self.next_epoch = epoch;
        self
    }
}

/// What happened in one epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Learning rate used for this epoch's updates.
    pub lr: f64,
    pub train: EpochMeans,
    /// Normalized validation means, when validation ran.
    pub val: Option<EpochMeans>,
    pub is_best: bool,
    pub batches: usize,
    pub global_step: usize,
}

/// Result of [`Trainer::fit`].
#[derive(Debug)]
pub struct FitReport<M, O> {
    pub state: TrainingState<M, O>,
    pub epochs: Vec<EpochSummary>,
    /// Epochs that set a new best validation loss, in order.
    pub best_epochs: Vec<usize>,
}

/// Owns the collaborators of a run and drives the epoch loop.
pub struct Trainer<B: AutodiffBackend, L, C, S> {
    config: TrainerConfig,
    device: B::Device,
    loss_fn: L,
    store: C,
    sink: S,
    best_log: BestEpochLog,
    history: LossHistory,
    phase: Phase,
}

impl<B, L, C, S> Trainer<B, L, C, S>
where
    B: AutodiffBackend,
    L: LossAggregator,
    S: ScalarSink,
{
    pub fn new(config: TrainerConfig, device: B::Device, loss_fn: L, store: C, sink: S) -> Self {
        let best_log = BestEpochLog::new(PathBuf::from(&config.save_root).join("best.txt"));
        Self {
            config,
            device,
            loss_fn,
            store,
            sink,
            best_log,
            history: LossHistory::default(),
            phase: Phase::AwaitingEpoch,
        }
    }

    /// Seed the plotted history, e.g. with the scalars of a resumed run.
    pub fn with_history(mut self, history: LossHistory) -> Self {
        self.history = history;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn best_log(&self) -> &BestEpochLog {
        &self.best_log
    }

    /// Run epochs `[state.next_epoch, total_epochs)`.
    ///
    /// Any runner, store, sink or plot failure aborts the run with its error.
    pub fn fit<M, O, T, V>(
        &mut self,
        mut state: TrainingState<M, O>,
        train: &T,
        val: Option<&V>,
    ) -> crate::Result<FitReport<M, O>>
    where
        M: PairModel<B> + AutodiffModule<B>,
        M::InnerModule: PairModel<B::InnerBackend>,
        O: Optimizer<M, B>,
        C: CheckpointStore<B, M, O>,
        T: BatchSource<B> + ?Sized,
        V: BatchSource<B::InnerBackend> + ?Sized,
    {
        let runner = EpochRunner::<B, L>::new(&self.device, &self.loss_fn)
            .with_progress(self.config.show_progress);
        let plot_path = PathBuf::from(&self.config.log_dir).join("train_val_loss.svg");
        let batches_per_epoch = train.num_batches();

        let val = match val {
            Some(v) if v.num_batches() == 0 => {
                tracing::warn!("Validation source is empty, validation disabled");
                None
            }
            other => other,
        };
        if val.is_none() || self.config.validation_frequency == 0 {
            tracing::info!("No validation: best-model tracking disabled");
        }

        if self.config.save_initial_weights && state.resumed_from.is_none() {
            self.phase = Phase::Checkpointing;
            self.store.save(Checkpoint {
                epoch: -1,
                model: &state.model,
                optimizer: &state.optimizer,
                scheduler: &state.scheduler,
                best_loss: state.best_loss,
                is_best: false,
            })?;
            tracing::info!("Saved initial weights (epoch -1)");
        }

        tracing::info!(
            start_epoch = state.next_epoch,
            total_epochs = self.config.total_epochs,
            batches_per_epoch,
            resumed_from = ?state.resumed_from,
            "Starting training"
        );

        let mut epochs = Vec::new();
        let mut best_epochs = Vec::new();

        for epoch in state.next_epoch..self.config.total_epochs {
            self.phase = Phase::Training;
            let lr = state.scheduler.lr();
            let request = TrainRequest {
                epoch,
                global_step: epoch * batches_per_epoch,
                lr,
                init_weights: self.config.init_weights,
            };
            let (model, outcome) =
                runner.train_epoch(state.model, &mut state.optimizer, train, request)?;
            state.model = model;
            let train_means = outcome.metrics;

            self.history
                .train
                .push(epoch, train_means.total, train_means.triplet, train_means.gn);
            let step = epoch as i64;
            self.sink.add_scalar(TRAIN_TOTAL_LOSS, train_means.total, step)?;
            self.sink.add_scalar(TRAIN_TRIPLET_LOSS, train_means.triplet, step)?;
            self.sink.add_scalar(TRAIN_GN_LOSS, train_means.gn, step)?;

            state.scheduler.step();

            let mut val_means = None;
            let freq = self.config.validation_frequency;
            if let Some(val) = val.filter(|_| freq > 0 && epoch % freq == 0) {
                self.phase = Phase::Validating;
                let means = runner.test_epoch(&state.model.valid(), val, epoch)?.normalized()?;
                self.history.val.push(epoch, means.total, means.triplet, means.gn);
                self.sink.add_scalar(VAL_TOTAL_LOSS, means.total, step)?;
                self.sink.add_scalar(VAL_TRIPLET_LOSS, means.triplet, step)?;
                self.sink.add_scalar(VAL_GN_LOSS, means.gn, step)?;
                val_means = Some(means);
            }

            self.phase = Phase::Checkpointing;
            let is_best = val_means.is_some_and(|m| m.total < state.best_loss);
            if let (true, Some(means)) = (is_best, val_means) {
                state.best_loss = means.total;
                self.best_log.append(epoch)?;
                best_epochs.push(epoch);
                if epoch + 1 >= self.config.best_checkpoint_min_epochs {
                    self.store.save(Checkpoint {
                        epoch: step,
                        model: &state.model,
                        optimizer: &state.optimizer,
                        scheduler: &state.scheduler,
                        best_loss: state.best_loss,
                        is_best: true,
                    })?;
                    tracing::info!(epoch, best_loss = state.best_loss, "Saved best checkpoint");
                }
            }

            self.store.save(Checkpoint {
                epoch: step,
                model: &state.model,
                optimizer: &state.optimizer,
                scheduler: &state.scheduler,
                best_loss: state.best_loss,
                is_best: false,
            })?;
            write_loss_plot(&plot_path, &self.history)?;
            state.next_epoch = epoch + 1;

            let lr_str = format!("{lr:.2e}");
            match val_means {
                Some(v) => tracing::info!(
                    epoch,
                    lr = %lr_str,
                    train_total = format!("{:.4}", train_means.total),
                    val_total = format!("{:.4}", v.total),
                    best = is_best,
                    "train triplet={:.4} gn={:.4} | val triplet={:.4} gn={:.4}",
                    train_means.triplet,
                    train_means.gn,
                    v.triplet,
                    v.gn,
                ),
                None => tracing::info!(
                    epoch,
                    lr = %lr_str,
                    train_total = format!("{:.4}", train_means.total),
                    "train triplet={:.4} gn={:.4}",
                    train_means.triplet,
                    train_means.gn,
                ),
            }

            epochs.push(EpochSummary {
                epoch,
                lr,
                train: train_means,
                val: val_means,
                is_best,
                batches: outcome.batches,
                global_step: outcome.global_step,
            });
            self.phase = Phase::AwaitingEpoch;
        }

        self.phase = Phase::Done;
        tracing::info!(
            epochs_run = epochs.len(),
            best_loss = state.best_loss,
            best_epochs = ?best_epochs,
            "Training complete"
        );

        Ok(FitReport {
            state,
            epochs,
            best_epochs,
        })
    }
}
