//! Epoch runners: one optimization pass and one evaluation pass over a batch
//! source.

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{Result, TrainError};
use crate::model::PairModel;
use crate::training::data::BatchSource;
use crate::training::loss::LossAggregator;
use crate::training::metrics::{EpochAccumulator, EpochMeans, EvalSums};

/// Per-epoch inputs of [`EpochRunner::train_epoch`].
#[derive(Debug, Clone, Copy)]
pub struct TrainRequest {
    pub epoch: usize,
    /// Global step of the first batch of this epoch.
    pub global_step: usize,
    pub lr: f64,
    /// Re-draw convolution weights before the first batch. Only honored at
    /// epoch 0.
    pub init_weights: bool,
}

/// Result of one training epoch.
#[derive(Debug, Clone, Copy)]
pub struct TrainEpochOutcome {
    pub metrics: EpochMeans,
    /// Global step after the last batch.
    pub global_step: usize,
    pub batches: usize,
}

/// Runs single epochs of training or evaluation on one device.
pub struct EpochRunner<'a, B: AutodiffBackend, L> {
    device: &'a B::Device,
    loss_fn: &'a L,
    show_progress: bool,
}

impl<'a, B: AutodiffBackend, L: LossAggregator> EpochRunner<'a, B, L> {
    pub fn new(device: &'a B::Device, loss_fn: &'a L) -> Self {
        Self {
            device,
            loss_fn,
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress(&self, len: usize, phase: &str, epoch: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_prefix(format!("{phase} epoch {epoch}"));
        pb
    }

    /// One optimization pass.
    ///
    /// Every batch is forwarded, scored, backpropagated and stepped before the
    /// next one is fetched. The model is moved in and handed back updated.
    pub fn train_epoch<M, O, S>(
        &self,
        mut model: M,
        optimizer: &mut O,
        source: &S,
        request: TrainRequest,
    ) -> Result<(M, TrainEpochOutcome)>
    where
        M: PairModel<B> + AutodiffModule<B>,
        O: Optimizer<M, B>,
        S: BatchSource<B> + ?Sized,
    {
        if request.init_weights && request.epoch == 0 {
            model = model.reinit_conv_layers();
            tracing::info!("Re-initialized convolution layers (Xavier normal, zero bias)");
        }

        let pb = self.progress(source.num_batches(), "train", request.epoch);
        let mut acc = EpochAccumulator::new();
        let mut global_step = request.global_step;

        for batch in source.batches(request.epoch) {
            let (images, correspondences) = batch.into_device(self.device);
            let outputs = model.forward_pair(images);
            let bundle = self
                .loss_fn
                .compute(&outputs, correspondences.as_ref(), global_step, true)?;

            let scalars = bundle.scalars()?;
            acc.add(&scalars, &bundle.levels);
            if let Some((total, triplet, gn)) = acc.running() {
                pb.set_message(format!("total={total:.4} triplet={triplet:.4} gn={gn:.4}"));
            }

            let grads = GradientsParams::from_grads(bundle.into_objective()?.backward(), &model);
            model = optimizer.step(request.lr, model, grads);
            global_step += 1;

            drop(outputs);
            drop(correspondences);
            B::sync(self.device);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let metrics = acc.mean()?;
        tracing::debug!(
            epoch = request.epoch,
            batches = acc.batches(),
            global_step,
            total = metrics.total,
            "Train epoch finished"
        );
        Ok((
            model,
            TrainEpochOutcome {
                metrics,
                global_step,
                batches: acc.batches(),
            },
        ))
    }

    /// One evaluation pass on the inner (non-autodiff) backend.
    ///
    /// Returns raw sums; the epoch index is passed to the loss as its step.
    pub fn test_epoch<M, S>(&self, model: &M, source: &S, epoch: usize) -> Result<EvalSums>
    where
        M: PairModel<B::InnerBackend>,
        S: BatchSource<B::InnerBackend> + ?Sized,
    {
        let pb = self.progress(source.num_batches(), "val", epoch);
        let mut sums = EvalSums::default();

        for batch in source.batches(epoch) {
            let (images, correspondences) = batch.into_device(self.device);
            let outputs = model.forward_pair(images);
            let bundle = self
                .loss_fn
                .compute(&outputs, correspondences.as_ref(), epoch, true)?;
            sums.add(&bundle.scalars()?, bundle.levels);

            drop(outputs);
            drop(correspondences);
            <B::InnerBackend as Backend>::sync(self.device);
            pb.inc(1);
        }
        pb.finish_and_clear();

        if sums.batches == 0 {
            return Err(TrainError::EmptyEpoch("validation"));
        }
        Ok(sums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::optim::AdamWConfig;

    use crate::model::pyramid::{GnNet, GnNetConfig};
    use crate::training::batch::{Batch, Images};
    use crate::training::data::VecSource;
    use crate::training::gn_loss::GnLossConfig;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn model() -> GnNet<TestAutodiffBackend> {
        GnNetConfig::new()
            .with_channels_in(1)
            .with_feature_dim(2)
            .init(&Default::default())
    }

    fn pair_batch<B: Backend>(seed: f32) -> Batch<B> {
        let device = Default::default();
        let image = |offset: f32| {
            Tensor::<B, 1, Int>::arange(0..64, &device)
                .float()
                .reshape([1, 1, 8, 8])
                .div_scalar(64.0)
                .add_scalar(seed + offset)
        };
        Batch::images_only(Images::Tuple(vec![image(0.0), image(0.1)]))
    }

    fn source<B: Backend>(n: usize) -> VecSource<B> {
        VecSource::new((0..n).map(|i| pair_batch(i as f32)).collect())
    }

    #[test]
    fn test_train_epoch_advances_global_step() {
        let device = Default::default();
        let loss = GnLossConfig::new().init();
        let runner = EpochRunner::<TestAutodiffBackend, _>::new(&device, &loss).with_progress(false);
        let mut optimizer = AdamWConfig::new().init();

        let request = TrainRequest {
            epoch: 2,
            global_step: 10,
            lr: 1e-3,
            init_weights: false,
        };
        let (_, outcome) = runner
            .train_epoch(model(), &mut optimizer, &source(3), request)
            .unwrap();
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.global_step, 13);
        assert_eq!(outcome.metrics.total, 0.0, "no correspondences gives zero loss");
    }

    #[test]
    fn test_empty_train_epoch_is_an_error() {
        let device = Default::default();
        let loss = GnLossConfig::new().init();
        let runner = EpochRunner::<TestAutodiffBackend, _>::new(&device, &loss).with_progress(false);
        let mut optimizer = AdamWConfig::new().init();
        let request = TrainRequest {
            epoch: 0,
            global_step: 0,
            lr: 1e-3,
            init_weights: false,
        };
        let err = runner
            .train_epoch(model(), &mut optimizer, &source(0), request)
            .unwrap_err();
        assert!(matches!(err, TrainError::EmptyEpoch("train")));
    }

    #[test]
    fn test_init_weights_only_at_epoch_zero() {
        let device = Default::default();
        let loss = GnLossConfig::new().init();
        let runner = EpochRunner::<TestAutodiffBackend, _>::new(&device, &loss).with_progress(false);
        let sample = pair_batch::<TestBackend>(0.5);
        let features = |m: &GnNet<TestAutodiffBackend>| -> Vec<f32> {
            let images = match sample.clone().images {
                Images::Tuple(t) => t,
                Images::Single(t) => vec![t],
            };
            let out = m.valid().forward_pair(images);
            crate::model::bridge::tensor_to_host(out.get(0).unwrap().clone()).unwrap()
        };

        // Zero learning rate: only re-initialization can change the weights.
        let start = model();
        let before = features(&start);
        let mut optimizer = AdamWConfig::new().init();
        let request = TrainRequest {
            epoch: 1,
            global_step: 0,
            lr: 0.0,
            init_weights: true,
        };
        let (kept, _) = runner
            .train_epoch(start, &mut optimizer, &source(1), request)
            .unwrap();
        assert_eq!(features(&kept), before, "epoch 1 must not re-initialize");

        let request = TrainRequest { epoch: 0, ..request };
        let (reinit, _) = runner
            .train_epoch(kept, &mut optimizer, &source(1), request)
            .unwrap();
        assert_ne!(features(&reinit), before, "epoch 0 re-initializes");
    }

    #[test]
    fn test_eval_epoch_sums() {
        let device = Default::default();
        let loss = GnLossConfig::new().init();
        let runner = EpochRunner::<TestAutodiffBackend, _>::new(&device, &loss).with_progress(false);
        let m = model().valid();

        let sums = runner.test_epoch(&m, &source::<TestBackend>(4), 3).unwrap();
        assert_eq!(sums.batches, 4);
        assert_eq!(sums.total, 0.0);

        let err = runner
            .test_epoch(&m, &source::<TestBackend>(0), 3)
            .unwrap_err();
        assert!(matches!(err, TrainError::EmptyEpoch("validation")));
    }
}
