//! Error type shared by the training core.

/// Failures that terminate a training run.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// A per-level breakdown did not have one entry per feature level.
    #[error("{field} breakdown has {got} levels, expected {expected}")]
    LevelMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    /// A loss term tensor carried no elements.
    #[error("loss term `{0}` is empty")]
    EmptyLoss(&'static str),

    /// An epoch iterated zero batches.
    #[error("{0} epoch iterated no batches")]
    EmptyEpoch(&'static str),

    /// The model produced a different number of feature maps than the loss expects.
    #[error("model output has {got} tensors, expected {expected}")]
    OutputArity { expected: usize, got: usize },

    /// A required correspondence field was absent from the batch.
    #[error("correspondence field `{0}` is missing")]
    MissingField(String),

    /// Saving or loading a checkpoint record failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor data could not be read back to the host.
    #[error("tensor data error: {0}")]
    Tensor(String),

    /// Rendering the loss plot failed.
    #[error("plot error: {0}")]
    Plot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
