//! Batch sources consumed by the epoch runners.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::training::batch::Batch;

/// A finite, re-iterable sequence of batches.
///
/// `batches(epoch)` must yield the same sequence for the same epoch so a
/// resumed run sees the data an uninterrupted run would have.
pub trait BatchSource<B: Backend> {
    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Batch<B>> + '_>;

    /// Number of batches one pass yields.
    fn num_batches(&self) -> usize;
}

/// Pre-built batches held in memory, yielded in order every epoch.
#[derive(Debug, Clone)]
pub struct VecSource<B: Backend> {
    batches: Vec<Batch<B>>,
}

impl<B: Backend> VecSource<B> {
    pub fn new(batches: Vec<Batch<B>>) -> Self {
        Self { batches }
    }
}

impl<B: Backend> BatchSource<B> for VecSource<B> {
    fn batches(&self, _epoch: usize) -> Box<dyn Iterator<Item = Batch<B>> + '_> {
        Box::new(self.batches.iter().cloned())
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

/// Seeded random split of `0..n` into `(train, val)` index lists.
///
/// The validation part has `round(n * val_fraction)` entries. Both lists are
/// returned sorted.
pub fn split_indices(n: usize, val_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let num_val = ((n as f64 * val_fraction.clamp(0.0, 1.0)).round() as usize).min(n);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut val = indices.split_off(n - num_val);
    let mut train = indices;
    train.sort_unstable();
    val.sort_unstable();
    (train, val)
}
