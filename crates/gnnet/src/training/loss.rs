//! Loss aggregation contract between the epoch runners and a multi-level loss.
//!
//! Every loss term is a 1-D tensor whose first element is the scalar value.
//! A plain scalar (`[1]`) and a wrapped sequence (`[k]`, scalar first) are
//! both accepted; runners only ever read the leading element.

use burn::prelude::*;

use crate::error::{Result, TrainError};
use crate::model::bridge::tensor_to_f64;
use crate::model::{ModelOutput, NUM_LEVELS};
use crate::training::batch::Correspondences;

/// Per-level diagnostics, index `l` is the same feature level in every array.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelBreakdown {
    pub triplet: [f64; NUM_LEVELS],
    pub gn: [f64; NUM_LEVELS],
    pub pos_mean: [f64; NUM_LEVELS],
    pub neg_mean: [f64; NUM_LEVELS],
}

fn level_array(field: &'static str, values: &[f64]) -> Result<[f64; NUM_LEVELS]> {
    values.try_into().map_err(|_| TrainError::LevelMismatch {
        field,
        expected: NUM_LEVELS,
        got: values.len(),
    })
}

impl LevelBreakdown {
    /// Build from per-level vectors collected on the host, rejecting any that
    /// is not exactly `NUM_LEVELS` long. Aggregators that gather one value per
    /// level into a `Vec` go through here.
    pub fn from_slices(
        triplet: &[f64],
        gn: &[f64],
        pos_mean: &[f64],
        neg_mean: &[f64],
    ) -> Result<Self> {
        Ok(Self {
            triplet: level_array("triplet", triplet)?,
            gn: level_array("gn", gn)?,
            pos_mean: level_array("pos_mean", pos_mean)?,
            neg_mean: level_array("neg_mean", neg_mean)?,
        })
    }

    pub fn accumulate(&mut self, other: &Self) {
        for l in 0..NUM_LEVELS {
            self.triplet[l] += other.triplet[l];
            self.gn[l] += other.gn[l];
            self.pos_mean[l] += other.pos_mean[l];
            self.neg_mean[l] += other.neg_mean[l];
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            triplet: self.triplet.map(|v| v * factor),
            gn: self.gn.map(|v| v * factor),
            pos_mean: self.pos_mean.map(|v| v * factor),
            neg_mean: self.neg_mean.map(|v| v * factor),
        }
    }
}

/// Host-side values of one bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossScalars {
    pub total: f64,
    pub triplet: f64,
    pub gn: f64,
    pub e1: f64,
    pub e2: f64,
}

/// Output of one aggregator call.
#[derive(Debug, Clone)]
pub struct LossBundle<B: Backend> {
    /// Objective the train runner backpropagates.
    pub total: Tensor<B, 1>,
    /// Metric-learning (triplet/contrastive) part of `total`.
    pub triplet: Tensor<B, 1>,
    /// Correspondence (Gauss-Newton) part of `total`.
    pub gn: Tensor<B, 1>,
    pub levels: LevelBreakdown,
    /// Auxiliary error-component magnitudes.
    pub e1: f64,
    pub e2: f64,
}

/// First element of a loss term as a one-element tensor.
pub fn leading_scalar<B: Backend>(term: Tensor<B, 1>, name: &'static str) -> Result<Tensor<B, 1>> {
    let [len] = term.dims();
    if len == 0 {
        return Err(TrainError::EmptyLoss(name));
    }
    Ok(if len == 1 { term } else { term.slice([0..1]) })
}

impl<B: Backend> LossBundle<B> {
    /// Read every term back to the host.
    pub fn scalars(&self) -> Result<LossScalars> {
        Ok(LossScalars {
            total: tensor_to_f64(leading_scalar(self.total.clone(), "total")?),
            triplet: tensor_to_f64(leading_scalar(self.triplet.clone(), "triplet")?),
            gn: tensor_to_f64(leading_scalar(self.gn.clone(), "gn")?),
            e1: self.e1,
            e2: self.e2,
        })
    }

    /// The one-element total loss to call `backward` on.
    pub fn into_objective(self) -> Result<Tensor<B, 1>> {
        leading_scalar(self.total, "total")
    }
}

/// A multi-term, multi-level loss over model outputs and correspondences.
///
/// Implementations are pure: no state may carry over between calls. The
/// method is generic over the backend so one aggregator serves both the
/// autodiff (train) and inner (eval) backends.
pub trait LossAggregator {
    /// - `outputs`: the model's forward output, unmodified.
    /// - `correspondences`: `None` for batches without ground-truth matches; a
    ///   well-formed bundle must still be returned.
    /// - `step`: global step during training, epoch index during evaluation.
    /// - `emit_breakdown`: when false, `levels` may be left zeroed.
    fn compute<B: Backend>(
        &self,
        outputs: &ModelOutput<B>,
        correspondences: Option<&Correspondences<B>>,
        step: usize,
        emit_breakdown: bool,
    ) -> Result<LossBundle<B>>;
}
