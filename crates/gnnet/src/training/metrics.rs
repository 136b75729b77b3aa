//! Per-epoch metric aggregation.

use crate::error::{Result, TrainError};
use crate::training::loss::{LevelBreakdown, LossScalars};

/// Epoch-level means of every loss term and breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMeans {
    pub total: f64,
    pub triplet: f64,
    pub gn: f64,
    pub e1: f64,
    pub e2: f64,
    pub levels: LevelBreakdown,
}

/// Running sums over the batches of one training epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    total: f64,
    triplet: f64,
    gn: f64,
    e1: f64,
    e2: f64,
    levels: LevelBreakdown,
    batches: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, scalars: &LossScalars, levels: &LevelBreakdown) {
        self.total += scalars.total;
        self.triplet += scalars.triplet;
        self.gn += scalars.gn;
        self.e1 += scalars.e1;
        self.e2 += scalars.e2;
        self.levels.accumulate(levels);
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Running means, or `None` before the first batch.
    pub fn running(&self) -> Option<(f64, f64, f64)> {
        if self.batches == 0 {
            return None;
        }
        let n = self.batches as f64;
        Some((self.total / n, self.triplet / n, self.gn / n))
    }

    /// Divide every sum by the number of batches iterated.
    pub fn mean(&self) -> Result<EpochMeans> {
        if self.batches == 0 {
            return Err(TrainError::EmptyEpoch("train"));
        }
        let n = self.batches as f64;
        Ok(EpochMeans {
            total: self.total / n,
            triplet: self.triplet / n,
            gn: self.gn / n,
            e1: self.e1 / n,
            e2: self.e2 / n,
            levels: self.levels.scaled(1.0 / n),
        })
    }
}

/// Raw output of an evaluation epoch.
///
/// Scalar terms are sums over batches; `last_levels` is the breakdown of the
/// final batch only, not a sum.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalSums {
    pub total: f64,
    pub triplet: f64,
    pub gn: f64,
    pub e1: f64,
    pub e2: f64,
    pub batches: usize,
    pub last_levels: LevelBreakdown,
}

impl EvalSums {
    pub fn add(&mut self, scalars: &LossScalars, levels: LevelBreakdown) {
        self.total += scalars.total;
        self.triplet += scalars.triplet;
        self.gn += scalars.gn;
        self.e1 += scalars.e1;
        self.e2 += scalars.e2;
        self.last_levels = levels;
        self.batches += 1;
    }

    /// Divide the sums and the last batch's breakdown by the batch count.
    pub fn normalized(&self) -> Result<EpochMeans> {
        if self.batches == 0 {
            return Err(TrainError::EmptyEpoch("validation"));
        }
        let n = self.batches as f64;
        Ok(EpochMeans {
            total: self.total / n,
            triplet: self.triplet / n,
            gn: self.gn / n,
            e1: self.e1 / n,
            e2: self.e2 / n,
            levels: self.last_levels.scaled(1.0 / n),
        })
    }
}
