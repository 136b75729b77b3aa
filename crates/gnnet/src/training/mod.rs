//! Training pipeline: batches and data sources, the loss aggregation contract
//! with the reference GN loss, epoch runners, the fit supervisor, and the
//! persistence around it (checkpoints, scalar sink, best-epoch log, loss plot).

pub mod batch;
pub mod checkpoint;
pub mod data;
pub mod gn_loss;
pub mod loss;
pub mod metrics;
pub mod plot;
pub mod runner;
pub mod schedule;
pub mod sink;
pub mod supervisor;
pub mod synthetic;
