//! Reference multi-level loss: a hard-negative triplet term plus a
//! Gauss-Newton correspondence term at every pyramid level.
//!
//! Expects the pair layout of [`GnNet`](crate::model::pyramid::GnNet): image A
//! levels `0..NUM_LEVELS` followed by image B levels `0..NUM_LEVELS`, and the
//! correspondence fields `"a"` / `"b"` holding `(x, y)` pixel coordinates of
//! shape `(n, matches, 2)` in original-image units.
//!
//! Per level, with features sampled by nearest pixel after dividing the
//! coordinates by `img_scale * 2^level`:
//!
//! ```text
//! d+       = ||f_A(a) - f_B(b)||²
//! d-       = ||f_A(a) - f_B(b_rot)||²        b_rot = b shifted by a step-dependent offset
//! triplet  = mean relu(d+ - d- + margin)
//! g, H     = Gauss-Newton gradient and damped Hessian of ||f_B(b) - f_A(a)||² over (x, y)
//! δ        = -H⁻¹ g
//! e1       = mean ½ δᵀ H δ
//! e2       = mean (log 2π - ½ log det H)
//! ```

use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::TensorData;

use crate::error::TrainError;
use crate::model::bridge::{tensor_to_f64, tensor_to_host};
use crate::model::{ModelOutput, NUM_LEVELS};
use crate::training::batch::Correspondences;
use crate::training::loss::{LevelBreakdown, LossAggregator, LossBundle};

/// Weights and margins of the reference loss.
#[derive(Config, Debug)]
pub struct GnLossConfig {
    /// Positive pairs closer than this contribute nothing to `pos_mean`.
    #[config(default = 0.2)]
    pub margin_pos: f64,
    /// Negative pairs farther than this contribute nothing to `neg_mean`.
    #[config(default = 1.0)]
    pub margin_neg: f64,
    /// Triplet margin.
    #[config(default = 1.0)]
    pub margin: f64,
    #[config(default = 1.0)]
    pub contrastive_lamda: f64,
    #[config(default = 0.003)]
    pub gn_lamda: f64,
    #[config(default = 1.0)]
    pub e1_lamda: f64,
    #[config(default = 1.0)]
    pub e2_lamda: f64,
    /// Ratio between correspondence coordinates and level-0 feature pixels.
    #[config(default = 2.0)]
    pub img_scale: f64,
    /// Upper bound on matches used per batch.
    #[config(default = 1024)]
    pub num_matches: usize,
    /// Added to the Hessian diagonal.
    #[config(default = 1e-3)]
    pub damping: f64,
}

impl GnLossConfig {
    pub fn init(&self) -> GnLoss {
        GnLoss {
            config: self.clone(),
        }
    }
}

/// Stateless aggregator built from [`GnLossConfig`].
#[derive(Debug, Clone)]
pub struct GnLoss {
    config: GnLossConfig,
}

/// Offset between a match and the match used as its negative.
///
/// Rotates through `1..m` as the step advances so every match is eventually
/// paired with every other one. Zero when there is a single match.
pub fn negative_offset(step: usize, m: usize) -> usize {
    if m > 1 {
        1 + step % (m - 1)
    } else {
        0
    }
}

/// Host-side coordinates of one correspondence field.
struct MatchCoords {
    values: Vec<f32>,
    /// Matches stored per batch element.
    stride: usize,
}

impl MatchCoords {
    fn read<B: Backend>(
        correspondences: &Correspondences<B>,
        field: &str,
        batch: usize,
    ) -> crate::Result<Self> {
        let tensor = correspondences
            .get(field)
            .ok_or_else(|| TrainError::MissingField(field.to_string()))?;
        let [n, m, xy] = tensor.dims();
        if n != batch || xy != 2 {
            return Err(TrainError::Tensor(format!(
                "correspondence `{field}` has shape [{n}, {m}, {xy}], expected [{batch}, _, 2]"
            )));
        }
        Ok(Self {
            values: tensor_to_host(tensor.clone())?,
            stride: m,
        })
    }

    /// Flat `y * w + x` indices for the first `m` matches of every batch
    /// element, sampled at `1 / scale` resolution.
    ///
    /// `shift` moves the sample one pixel right/down (clamped to the map) and
    /// `rotate` pairs match `j` with stored match `(j + rotate) % m`.
    fn pixel_indices(
        &self,
        n: usize,
        m: usize,
        scale: f64,
        (h, w): (usize, usize),
        shift: (usize, usize),
        rotate: usize,
    ) -> Vec<i64> {
        let mut indices = Vec::with_capacity(n * m);
        for i in 0..n {
            for j in 0..m {
                let src = (i * self.stride + (j + rotate) % m) * 2;
                let x = pixel(self.values[src], scale, w) + shift.0;
                let y = pixel(self.values[src + 1], scale, h) + shift.1;
                indices.push((y.min(h - 1) * w + x.min(w - 1)) as i64);
            }
        }
        indices
    }
}

/// Both correspondence fields, truncated to `m` matches.
struct MatchPair {
    a: MatchCoords,
    b: MatchCoords,
    m: usize,
}

fn pixel(coord: f32, scale: f64, size: usize) -> usize {
    let p = (coord as f64 / scale).floor();
    if p <= 0.0 {
        0
    } else {
        (p as usize).min(size - 1)
    }
}

/// Gather `(n, c, m)` features from `(n, c, h, w)` at flat pixel indices.
fn sample<B: Backend>(features: &Tensor<B, 4>, indices: &[i64], m: usize) -> Tensor<B, 3> {
    let [n, c, h, w] = features.dims();
    let mut expanded = Vec::with_capacity(n * c * m);
    for i in 0..n {
        let row = &indices[i * m..(i + 1) * m];
        for _ in 0..c {
            expanded.extend_from_slice(row);
        }
    }
    let index = Tensor::<B, 3, Int>::from_data(
        TensorData::new(expanded, [n, c, m]),
        &features.device(),
    );
    features.clone().reshape([n, c, h * w]).gather(2, index)
}

/// Sum over the channel axis, flattened to `(n * m,)`.
fn channel_sum<B: Backend>(t: Tensor<B, 3>) -> Tensor<B, 1> {
    t.sum_dim(1).flatten(0, 2)
}

struct LevelTerms<B: Backend> {
    triplet: Tensor<B, 1>,
    pos_mean: Tensor<B, 1>,
    neg_mean: Tensor<B, 1>,
    e1: Tensor<B, 1>,
    e2: Tensor<B, 1>,
}

impl GnLoss {
    pub fn config(&self) -> &GnLossConfig {
        &self.config
    }

    fn level_terms<B: Backend>(
        &self,
        level: usize,
        feat_a: &Tensor<B, 4>,
        feat_b: &Tensor<B, 4>,
        pair: &MatchPair,
        step: usize,
    ) -> LevelTerms<B> {
        let cfg = &self.config;
        let (a, b, m) = (&pair.a, &pair.b, pair.m);
        let scale = cfg.img_scale * (1usize << level) as f64;
        let [n, _, ha, wa] = feat_a.dims();
        let [_, _, hb, wb] = feat_b.dims();
        let rotate = negative_offset(step, m);

        let fa = sample(feat_a, &a.pixel_indices(n, m, scale, (ha, wa), (0, 0), 0), m);
        let fb = sample(feat_b, &b.pixel_indices(n, m, scale, (hb, wb), (0, 0), 0), m);
        let fneg = sample(feat_b, &b.pixel_indices(n, m, scale, (hb, wb), (0, 0), rotate), m);
        let fb_x = sample(feat_b, &b.pixel_indices(n, m, scale, (hb, wb), (1, 0), 0), m);
        let fb_y = sample(feat_b, &b.pixel_indices(n, m, scale, (hb, wb), (0, 1), 0), m);

        let d_pos = channel_sum((fb.clone() - fa.clone()).powf_scalar(2.0));
        let d_neg = channel_sum((fneg - fa.clone()).powf_scalar(2.0));

        let triplet = relu(d_pos.clone() - d_neg.clone() + cfg.margin).mean();
        let pos_mean = relu(d_pos - cfg.margin_pos).mean();
        let neg_mean = relu(d_neg.neg() + cfg.margin_neg).mean();

        let residual = fb.clone() - fa;
        let gx = fb_x - fb.clone();
        let gy = fb_y - fb;

        let g1 = channel_sum(gx.clone() * residual.clone());
        let g2 = channel_sum(gy.clone() * residual);
        let h11 = channel_sum(gx.clone().powf_scalar(2.0)) + cfg.damping;
        let h22 = channel_sum(gy.clone().powf_scalar(2.0)) + cfg.damping;
        let h12 = channel_sum(gx * gy);

        let det = (h11.clone() * h22.clone() - h12.clone().powf_scalar(2.0))
            .clamp_min(cfg.damping * cfg.damping);
        let dx = (h12.clone() * g2.clone() - h22.clone() * g1.clone()) / det.clone();
        let dy = (h12.clone() * g1 - h11.clone() * g2) / det.clone();

        let quad = h11 * dx.clone().powf_scalar(2.0)
            + h12 * dx * dy.clone() * 2.0
            + h22 * dy.powf_scalar(2.0);
        let e1 = quad.mean() * 0.5;
        let e2 = (det.log() * -0.5 + (2.0 * std::f64::consts::PI).ln()).mean();

        LevelTerms {
            triplet,
            pos_mean,
            neg_mean,
            e1,
            e2,
        }
    }

    fn zero_bundle<B: Backend>(outputs: &ModelOutput<B>) -> crate::Result<LossBundle<B>> {
        let anchor = outputs
            .get(0)
            .ok_or(TrainError::OutputArity {
                expected: 2 * NUM_LEVELS,
                got: 0,
            })?
            .clone()
            .sum()
            * 0.0;
        Ok(LossBundle {
            total: anchor.clone(),
            triplet: anchor.clone(),
            gn: anchor,
            levels: LevelBreakdown::default(),
            e1: 0.0,
            e2: 0.0,
        })
    }
}

impl LossAggregator for GnLoss {
    fn compute<B: Backend>(
        &self,
        outputs: &ModelOutput<B>,
        correspondences: Option<&Correspondences<B>>,
        step: usize,
        emit_breakdown: bool,
    ) -> crate::Result<LossBundle<B>> {
        if outputs.len() != 2 * NUM_LEVELS {
            return Err(TrainError::OutputArity {
                expected: 2 * NUM_LEVELS,
                got: outputs.len(),
            });
        }
        let Some(correspondences) = correspondences else {
            // Zero terms, still attached to the graph so backward is valid.
            return Self::zero_bundle(outputs);
        };

        let tensors = outputs.tensors();
        let [n, _, _, _] = tensors[0].dims();
        let a = MatchCoords::read(correspondences, "a", n)?;
        let b = MatchCoords::read(correspondences, "b", n)?;
        if a.stride != b.stride {
            return Err(TrainError::Tensor(format!(
                "correspondence fields disagree: {} vs {} matches",
                a.stride, b.stride
            )));
        }
        let m = a.stride.min(self.config.num_matches);
        if m == 0 {
            return Self::zero_bundle(outputs);
        }
        let pair = MatchPair { a, b, m };

        let cfg = &self.config;
        let mut host: [Vec<f64>; 4] = Default::default();
        let mut triplets = Vec::with_capacity(NUM_LEVELS);
        let mut gns = Vec::with_capacity(NUM_LEVELS);
        let (mut e1_sum, mut e2_sum) = (0.0, 0.0);

        for level in 0..NUM_LEVELS {
            let terms =
                self.level_terms(level, &tensors[level], &tensors[NUM_LEVELS + level], &pair, step);
            e1_sum += tensor_to_f64(terms.e1.clone());
            e2_sum += tensor_to_f64(terms.e2.clone());
            let gn = terms.e1 * cfg.e1_lamda + terms.e2 * cfg.e2_lamda;

            if emit_breakdown {
                host[0].push(tensor_to_f64(terms.triplet.clone()));
                host[1].push(tensor_to_f64(gn.clone()));
                host[2].push(tensor_to_f64(terms.pos_mean));
                host[3].push(tensor_to_f64(terms.neg_mean));
            }
            triplets.push(terms.triplet);
            gns.push(gn);
        }

        let levels = if emit_breakdown {
            let [triplet, gn, pos_mean, neg_mean] = &host;
            LevelBreakdown::from_slices(triplet, gn, pos_mean, neg_mean)?
        } else {
            LevelBreakdown::default()
        };

        let triplet = Tensor::cat(triplets, 0).sum() * cfg.contrastive_lamda;
        let gn = Tensor::cat(gns, 0).sum() * cfg.gn_lamda;
        let total = triplet.clone() + gn.clone();

        Ok(LossBundle {
            total,
            triplet,
            gn,
            levels,
            e1: e1_sum,
            e2: e2_sum,
        })
    }
}
