//! Trainer for a siamese feature-pyramid network optimized with a mixed
//! triplet + Gauss-Newton correspondence loss.
//!
//! Provides the epoch runners and the fit supervisor on top of burn, the
//! multi-level loss aggregation contract with a reference GN loss, a small
//! 4-level convolutional pyramid, checkpointing, scalar logging and loss plots.

pub mod error;
pub mod model;
pub mod training;

pub use error::{Result, TrainError};
