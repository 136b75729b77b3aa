//! Integration tests for the epoch loop: metric means, validation cadence,
//! best-model tracking, checkpoint cadence and resume.
//!
//! Scripted losses make the supervisor's decisions observable without
//! depending on what the network learns.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use gnnet::model::pyramid::{GnNet, GnNetConfig};
use gnnet::model::{ModelOutput, NUM_LEVELS};
use gnnet::training::batch::{Batch, Correspondences, Images};
use gnnet::training::checkpoint::{
    load_checkpoint, Checkpoint, CheckpointStore, FileCheckpointStore,
};
use gnnet::training::data::VecSource;
use gnnet::training::gn_loss::GnLossConfig;
use gnnet::training::loss::{LevelBreakdown, LossAggregator, LossBundle};
use gnnet::training::schedule::StepLr;
use gnnet::training::sink::{
    read_scalars, JsonlScalarSink, MemorySink, TRAIN_TOTAL_LOSS, VAL_TOTAL_LOSS,
};
use gnnet::training::supervisor::{Phase, Trainer, TrainerConfig, TrainingState};
use gnnet::training::synthetic::{PairDataset, PairLoader, SyntheticPairsConfig};
use gnnet::TrainError;

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

/// Returns pre-scripted totals, one per call, in call order.
struct ScriptedLoss {
    values: RefCell<VecDeque<f64>>,
}

impl ScriptedLoss {
    fn new(values: impl IntoIterator<Item = f64>) -> Self {
        Self {
            values: RefCell::new(values.into_iter().collect()),
        }
    }
}

impl LossAggregator for ScriptedLoss {
    fn compute<B: Backend>(
        &self,
        outputs: &ModelOutput<B>,
        _correspondences: Option<&Correspondences<B>>,
        _step: usize,
        _emit_breakdown: bool,
    ) -> gnnet::Result<LossBundle<B>> {
        let value = self
            .values
            .borrow_mut()
            .pop_front()
            .expect("loss script exhausted");
        let anchor = outputs.get(0).expect("model output").clone().sum() * 0.0;
        Ok(LossBundle {
            total: anchor.clone() + value,
            triplet: anchor.clone() + value,
            gn: anchor,
            levels: LevelBreakdown::default(),
            e1: 0.0,
            e2: 0.0,
        })
    }
}

/// Records `(epoch, is_best)` of every save.
#[derive(Default)]
struct RecordingStore {
    saves: Vec<(i64, bool)>,
}

impl<B, M, O> CheckpointStore<B, M, O> for RecordingStore
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn save(&mut self, checkpoint: Checkpoint<'_, M, O>) -> gnnet::Result<()> {
        self.saves.push((checkpoint.epoch, checkpoint.is_best));
        Ok(())
    }
}

impl RecordingStore {
    fn regular(&self) -> Vec<i64> {
        self.saves.iter().filter(|s| !s.1).map(|s| s.0).collect()
    }

    fn best(&self) -> Vec<i64> {
        self.saves.iter().filter(|s| s.1).map(|s| s.0).collect()
    }
}

fn tiny_model() -> GnNet<TestAutodiffBackend> {
    GnNetConfig::new()
        .with_channels_in(1)
        .with_feature_dim(2)
        .init(&Default::default())
}

fn image_source<B: Backend>(batches: usize) -> VecSource<B> {
    let device = Default::default();
    VecSource::new(
        (0..batches)
            .map(|_| {
                let image = || Tensor::<B, 4>::ones([1, 1, 8, 8], &device);
                Batch::images_only(Images::Tuple(vec![image(), image()]))
            })
            .collect(),
    )
}

fn config(tmp: &tempfile::TempDir, total_epochs: usize) -> TrainerConfig {
    TrainerConfig::new()
        .with_total_epochs(total_epochs)
        .with_show_progress(false)
        .with_save_root(tmp.path().join("ckpt").display().to_string())
        .with_log_dir(tmp.path().join("logs").display().to_string())
}

fn fresh_state(
) -> TrainingState<GnNet<TestAutodiffBackend>, impl Optimizer<GnNet<TestAutodiffBackend>, TestAutodiffBackend>>
{
    TrainingState::new(tiny_model(), AdamWConfig::new().init(), StepLr::new(1e-3, 1, 0.85))
}

#[test]
fn test_epoch_mean_of_scripted_losses() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut trainer = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&tmp, 1),
        Default::default(),
        ScriptedLoss::new([1.0, 2.0, 3.0, 4.0, 5.0]),
        RecordingStore::default(),
        MemorySink::new(),
    );

    let report = trainer
        .fit(fresh_state(), &image_source(5), None::<&VecSource<TestBackend>>)
        .unwrap();

    assert_eq!(report.epochs.len(), 1);
    let summary = &report.epochs[0];
    assert!((summary.train.total - 3.0).abs() < 1e-6);
    assert_eq!(summary.batches, 5);
    assert_eq!(summary.global_step, 5);
    assert!(summary.val.is_none());
    assert_eq!(trainer.phase(), Phase::Done);
    assert_eq!(trainer.sink().series(TRAIN_TOTAL_LOSS).len(), 1);
    assert!(tmp.path().join("logs/train_val_loss.svg").exists());
}

#[test]
fn test_validation_every_second_epoch() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut trainer = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&tmp, 5).with_validation_frequency(2),
        Default::default(),
        ScriptedLoss::new(std::iter::repeat(1.0).take(8)),
        RecordingStore::default(),
        MemorySink::new(),
    );

    let report = trainer
        .fit(fresh_state(), &image_source(1), Some(&image_source::<TestBackend>(1)))
        .unwrap();

    let validated: Vec<usize> = report
        .epochs
        .iter()
        .filter(|e| e.val.is_some())
        .map(|e| e.epoch)
        .collect();
    assert_eq!(validated, vec![0, 2, 4]);
    let logged: Vec<i64> = trainer
        .sink()
        .series(VAL_TOTAL_LOSS)
        .iter()
        .map(|(epoch, _)| *epoch)
        .collect();
    assert_eq!(logged, vec![0, 2, 4]);
    assert_eq!(trainer.history().val.epochs, vec![1.0, 3.0, 5.0]);
}

#[test]
fn test_best_log_records_improvements_only() {
    let tmp = tempfile::TempDir::new().unwrap();
    // Call order: e0 train, e0 val, e1 train, e2 train, e2 val, e3 train, e4 train, e4 val.
    let script = [1.0, 5.0, 1.0, 1.0, 3.0, 1.0, 1.0, 4.0];
    let mut trainer = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&tmp, 5).with_validation_frequency(2),
        Default::default(),
        ScriptedLoss::new(script),
        RecordingStore::default(),
        MemorySink::new(),
    );

    let report = trainer
        .fit(fresh_state(), &image_source(1), Some(&image_source::<TestBackend>(1)))
        .unwrap();

    assert_eq!(report.best_epochs, vec![0, 2]);
    assert_eq!(trainer.best_log().read().unwrap(), vec![0, 2]);
    assert!((report.state.best_loss - 3.0).abs() < 1e-6);
    // Best checkpoints wait for epoch 19.
    assert!(trainer.store().best().is_empty());
}

#[test]
fn test_checkpoint_cadence() {
    let tmp = tempfile::TempDir::new().unwrap();
    let epochs = 22;
    // Every validation improves: train 1.0, val 100 - epoch.
    let script = (0..epochs).flat_map(|e| [1.0, 100.0 - e as f64]);
    let mut trainer = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&tmp, epochs),
        Default::default(),
        ScriptedLoss::new(script),
        RecordingStore::default(),
        MemorySink::new(),
    );

    let report = trainer
        .fit(fresh_state(), &image_source(1), Some(&image_source::<TestBackend>(1)))
        .unwrap();

    let expected_regular: Vec<i64> = (-1..epochs as i64).collect();
    assert_eq!(trainer.store().regular(), expected_regular);
    assert_eq!(trainer.store().best(), vec![19, 20, 21]);
    assert_eq!(report.best_epochs.len(), epochs);
    assert_eq!(trainer.best_log().read().unwrap().len(), epochs);
}

#[test]
fn test_no_best_checkpoint_without_improvement() {
    let tmp = tempfile::TempDir::new().unwrap();
    let epochs = 22;
    // Validation falls to 81 at epoch 19, then regresses.
    let script = (0..epochs).flat_map(|e| {
        let val = if e <= 19 { 100.0 - e as f64 } else { 500.0 };
        [1.0, val]
    });
    let mut trainer = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&tmp, epochs),
        Default::default(),
        ScriptedLoss::new(script),
        RecordingStore::default(),
        MemorySink::new(),
    );

    let report = trainer
        .fit(fresh_state(), &image_source(1), Some(&image_source::<TestBackend>(1)))
        .unwrap();

    let expected_best: Vec<usize> = (0..=19).collect();
    assert_eq!(trainer.store().best(), vec![19]);
    assert_eq!(report.best_epochs, expected_best);
    assert_eq!(trainer.best_log().read().unwrap(), expected_best);
    assert!((report.state.best_loss - 81.0).abs() < 1e-6);
    assert_eq!(trainer.store().regular().len(), epochs + 1);
}

#[test]
fn test_resumed_state_skips_initial_checkpoint() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut trainer = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&tmp, 3),
        Default::default(),
        ScriptedLoss::new([1.0]),
        RecordingStore::default(),
        MemorySink::new(),
    );
    let mut state = fresh_state().with_next_epoch(2);
    state.resumed_from = Some(1);

    let report = trainer
        .fit(state, &image_source(1), None::<&VecSource<TestBackend>>)
        .unwrap();
    assert_eq!(report.epochs.len(), 1);
    assert_eq!(report.epochs[0].epoch, 2);
    assert_eq!(report.epochs[0].global_step, 3);
    assert_eq!(trainer.store().regular(), vec![2]);
}

#[test]
fn test_run_without_correspondences_completes() {
    let tmp = tempfile::TempDir::new().unwrap();
    let device = Default::default();
    let dataset = Arc::new(PairDataset::generate(
        &SyntheticPairsConfig::new()
            .with_num_pairs(4)
            .with_channels(1)
            .with_height(8)
            .with_width(8)
            .with_num_matches(4),
    ));
    let train = PairLoader::<TestAutodiffBackend>::new(dataset.clone(), vec![0, 1, 2], 2, device)
        .with_correspondences(false);
    let val = PairLoader::<TestBackend>::new(dataset, vec![3], 1, device)
        .with_correspondences(false);

    let mut trainer = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&tmp, 2),
        device,
        GnLossConfig::new().init(),
        RecordingStore::default(),
        MemorySink::new(),
    );
    let report = trainer.fit(fresh_state(), &train, Some(&val)).unwrap();

    assert_eq!(report.epochs.len(), 2);
    for summary in &report.epochs {
        assert_eq!(summary.train.total, 0.0);
        assert_eq!(summary.train.levels.triplet.len(), NUM_LEVELS);
        assert_eq!(summary.val.map(|v| v.total), Some(0.0));
    }
    // 0.0 < INFINITY: epoch 0 is the only improvement.
    assert_eq!(report.best_epochs, vec![0]);
}

#[test]
fn test_breakdown_length_is_enforced() {
    let err = LevelBreakdown::from_slices(&[1.0; 4], &[1.0; 4], &[1.0; 3], &[1.0; 4]).unwrap_err();
    assert!(matches!(
        err,
        TrainError::LevelMismatch {
            field: "pos_mean",
            expected: 4,
            got: 3
        }
    ));
}

fn synthetic_loaders() -> (
    PairLoader<TestAutodiffBackend>,
    PairLoader<TestBackend>,
) {
    let device = Default::default();
    let dataset = Arc::new(PairDataset::generate(
        &SyntheticPairsConfig::new()
            .with_num_pairs(6)
            .with_channels(1)
            .with_height(16)
            .with_width(16)
            .with_num_matches(8)
            .with_seed(5),
    ));
    let train = PairLoader::new(dataset.clone(), vec![0, 1, 2, 3], 2, device).with_shuffle(9);
    let val = PairLoader::new(dataset, vec![4, 5], 2, device);
    (train, val)
}

#[test]
fn test_resume_reproduces_uninterrupted_run() {
    let device = Default::default();
    let (train, val) = synthetic_loaders();
    let initial = tiny_model();
    let scheduler = StepLr::new(1e-2, 1, 0.85);
    let loss = || GnLossConfig::new().with_num_matches(8).init();

    // Uninterrupted: epochs 0..4.
    let full_dir = tempfile::TempDir::new().unwrap();
    let mut full = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&full_dir, 4),
        device,
        loss(),
        FileCheckpointStore::new(full_dir.path().join("ckpt")),
        MemorySink::new(),
    );
    let full_report = full
        .fit(
            TrainingState::new(initial.clone(), AdamWConfig::new().init(), scheduler.clone()),
            &train,
            Some(&val),
        )
        .unwrap();

    // Interrupted after epoch 1, then resumed from its checkpoint.
    let split_dir = tempfile::TempDir::new().unwrap();
    let store_root = split_dir.path().join("ckpt");
    let mut first = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&split_dir, 2),
        device,
        loss(),
        FileCheckpointStore::new(&store_root),
        JsonlScalarSink::open(split_dir.path().join("logs/scalars.jsonl"), None).unwrap(),
    );
    first
        .fit(
            TrainingState::new(initial, AdamWConfig::new().init(), scheduler),
            &train,
            Some(&val),
        )
        .unwrap();

    let resumed = load_checkpoint(
        &store_root.join("epoch_1"),
        tiny_model(),
        AdamWConfig::new().init(),
        &device,
    )
    .unwrap();
    let state = TrainingState::from_resumed(resumed);
    assert_eq!(state.next_epoch, 2);

    let mut second = Trainer::<TestAutodiffBackend, _, _, _>::new(
        config(&split_dir, 4),
        device,
        loss(),
        FileCheckpointStore::new(&store_root),
        JsonlScalarSink::open(split_dir.path().join("logs/scalars.jsonl"), Some(2)).unwrap(),
    );
    let resumed_report = second.fit(state, &train, Some(&val)).unwrap();

    assert_eq!(resumed_report.epochs.len(), 2);
    for (resumed, uninterrupted) in resumed_report.epochs.iter().zip(&full_report.epochs[2..]) {
        assert_eq!(resumed.epoch, uninterrupted.epoch);
        assert!((resumed.lr - uninterrupted.lr).abs() < 1e-12);
        assert!(
            (resumed.train.total - uninterrupted.train.total).abs() < 1e-4,
            "epoch {}: {} vs {}",
            resumed.epoch,
            resumed.train.total,
            uninterrupted.train.total
        );
        let (rv, uv) = (resumed.val.unwrap(), uninterrupted.val.unwrap());
        assert!((rv.total - uv.total).abs() < 1e-4);
    }
    assert!((resumed_report.state.best_loss - full_report.state.best_loss).abs() < 1e-4);

    // Four epochs of train scalars, each logged once.
    let scalars = read_scalars(&split_dir.path().join("logs/scalars.jsonl")).unwrap();
    let train_epochs: Vec<i64> = scalars
        .iter()
        .filter(|r| r.tag == TRAIN_TOTAL_LOSS)
        .map(|r| r.epoch)
        .collect();
    assert_eq!(train_epochs, vec![0, 1, 2, 3]);
}
