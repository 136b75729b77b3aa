//! Synthetic image pairs with exact correspondences.
//!
//! Image A is smoothed noise; image B is A circularly shifted by a random
//! offset. Every sampled pixel of A therefore has a known match in B, which
//! is enough to drive both loss terms end to end without a real dataset.

use std::sync::Arc;

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::model::bridge::{coords_to_tensor, images_to_tensor};
use crate::training::batch::{Batch, Correspondences, Images};
use crate::training::data::BatchSource;

/// Shape and randomness of the generated pairs.
#[derive(Config, Debug)]
pub struct SyntheticPairsConfig {
    #[config(default = 200)]
    pub num_pairs: usize,
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 64)]
    pub height: usize,
    #[config(default = 64)]
    pub width: usize,
    /// Correspondences stored per pair.
    #[config(default = 128)]
    pub num_matches: usize,
    /// Largest shift between A and B along each axis, in pixels.
    #[config(default = 4)]
    pub max_shift: usize,
    /// Coordinates are stored in units of `pixel * coord_scale`.
    #[config(default = 2.0)]
    pub coord_scale: f64,
    #[config(default = 0)]
    pub seed: u64,
}

/// One generated pair on the host.
#[derive(Debug, Clone)]
struct Pair {
    image_a: Vec<f32>,
    image_b: Vec<f32>,
    coords_a: Vec<f32>,
    coords_b: Vec<f32>,
}

/// All generated pairs, shared between loaders.
#[derive(Debug)]
pub struct PairDataset {
    config: SyntheticPairsConfig,
    pairs: Vec<Pair>,
}

/// 3x3 circular box blur of one `h x w` plane.
fn blur(plane: &[f32], h: usize, w: usize) -> Vec<f32> {
    let mut out = vec![0.0; h * w];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for oy in [h - 1, 0, 1] {
                for ox in [w - 1, 0, 1] {
                    acc += plane[((y + oy) % h) * w + (x + ox) % w];
                }
            }
            out[y * w + x] = acc / 9.0;
        }
    }
    out
}

impl PairDataset {
    pub fn generate(config: &SyntheticPairsConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let (c, h, w) = (config.channels, config.height, config.width);
        let shift = config.max_shift as i64;
        let scale = config.coord_scale as f32;

        let pairs = (0..config.num_pairs)
            .map(|_| {
                let mut image_a = Vec::with_capacity(c * h * w);
                for _ in 0..c {
                    let noise: Vec<f32> = (0..h * w).map(|_| rng.gen_range(-1.0..1.0)).collect();
                    image_a.extend(blur(&noise, h, w));
                }

                let dx = rng.gen_range(-shift..=shift).rem_euclid(w as i64) as usize;
                let dy = rng.gen_range(-shift..=shift).rem_euclid(h as i64) as usize;

                // B(x + dx, y + dy) = A(x, y)
                let mut image_b = vec![0.0; c * h * w];
                for ch in 0..c {
                    for y in 0..h {
                        for x in 0..w {
                            let dst = ch * h * w + ((y + dy) % h) * w + (x + dx) % w;
                            image_b[dst] = image_a[ch * h * w + y * w + x];
                        }
                    }
                }

                let mut coords_a = Vec::with_capacity(config.num_matches * 2);
                let mut coords_b = Vec::with_capacity(config.num_matches * 2);
                for _ in 0..config.num_matches {
                    let x = rng.gen_range(0..w);
                    let y = rng.gen_range(0..h);
                    let (bx, by) = ((x + dx) % w, (y + dy) % h);
                    // Pixel centers, so flooring after division recovers the pixel.
                    coords_a.extend([(x as f32 + 0.5) * scale, (y as f32 + 0.5) * scale]);
                    coords_b.extend([(bx as f32 + 0.5) * scale, (by as f32 + 0.5) * scale]);
                }

                Pair {
                    image_a,
                    image_b,
                    coords_a,
                    coords_b,
                }
            })
            .collect();

        tracing::info!(
            num_pairs = config.num_pairs,
            height = h,
            width = w,
            num_matches = config.num_matches,
            "Generated synthetic pairs"
        );

        Self {
            config: config.clone(),
            pairs,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn config(&self) -> &SyntheticPairsConfig {
        &self.config
    }

    /// Concatenate one field of the pairs at `indices`.
    fn concat(&self, indices: &[usize], field: impl Fn(&Pair) -> &Vec<f32>) -> Vec<f32> {
        let mut out = Vec::new();
        for &i in indices {
            out.extend_from_slice(field(&self.pairs[i]));
        }
        out
    }

    /// Build one batch from the pairs at `indices`.
    pub fn batch<B: Backend>(
        &self,
        indices: &[usize],
        with_correspondences: bool,
        device: &B::Device,
    ) -> Batch<B> {
        let cfg = &self.config;
        let n = indices.len();
        let shape = [n, cfg.channels, cfg.height, cfg.width];
        let images = Images::Tuple(vec![
            images_to_tensor(self.concat(indices, |p| &p.image_a), shape, device),
            images_to_tensor(self.concat(indices, |p| &p.image_b), shape, device),
        ]);

        let mut correspondences = Correspondences::new();
        if with_correspondences {
            let m = cfg.num_matches;
            correspondences.insert(
                "a".to_string(),
                coords_to_tensor(self.concat(indices, |p| &p.coords_a), n, m, device),
            );
            correspondences.insert(
                "b".to_string(),
                coords_to_tensor(self.concat(indices, |p| &p.coords_b), n, m, device),
            );
        }
        Batch::new(images, correspondences)
    }
}

/// Batches a subset of a [`PairDataset`], optionally reshuffled per epoch.
#[derive(Debug, Clone)]
pub struct PairLoader<B: Backend> {
    dataset: Arc<PairDataset>,
    indices: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    with_correspondences: bool,
    device: B::Device,
}

impl<B: Backend> PairLoader<B> {
    pub fn new(
        dataset: Arc<PairDataset>,
        indices: Vec<usize>,
        batch_size: usize,
        device: B::Device,
    ) -> Self {
        Self {
            dataset,
            indices,
            batch_size: batch_size.max(1),
            shuffle: false,
            seed: 0,
            with_correspondences: true,
            device,
        }
    }

    /// Shuffle with `seed + epoch` at the start of every epoch.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn with_correspondences(mut self, enabled: bool) -> Self {
        self.with_correspondences = enabled;
        self
    }

    fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order = self.indices.clone();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64)));
        }
        order
    }
}

impl<B: Backend> BatchSource<B> for PairLoader<B> {
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Batch<B>> + '_> {
        let order = self.epoch_order(epoch);
        let chunks: Vec<Vec<usize>> = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect();
        Box::new(chunks.into_iter().map(move |chunk| {
            self.dataset
                .batch(&chunk, self.with_correspondences, &self.device)
        }))
    }

    fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}
