//! Network components: the pair-model contract, a convolution layer with
//! one-time re-initialization, the 4-level siamese pyramid, and tensor bridge
//! helpers between host buffers and burn tensors.

pub mod bridge;
pub mod conv;
pub mod pyramid;

use burn::prelude::*;

/// Number of feature-map resolutions every model and loss works with.
pub const NUM_LEVELS: usize = 4;

/// Ordered tensors produced by one forward pass.
///
/// The training loop never looks inside; it is handed whole to the loss
/// aggregator, which owns the layout convention.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    tensors: Vec<Tensor<B, 4>>,
}

impl<B: Backend> ModelOutput<B> {
    pub fn new(tensors: Vec<Tensor<B, 4>>) -> Self {
        Self { tensors }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Tensor<B, 4>> {
        self.tensors.get(index)
    }

    pub fn tensors(&self) -> &[Tensor<B, 4>] {
        &self.tensors
    }
}

/// A network trained on image tuples.
///
/// `forward_pair` receives the batch's images in tuple order (already on the
/// compute device) and returns the opaque output handed to the loss.
pub trait PairModel<B: Backend>: Module<B> {
    fn forward_pair(&self, images: Vec<Tensor<B, 4>>) -> ModelOutput<B>;

    /// Re-draw every convolution weight (variance scaling) and zero its bias.
    fn reinit_conv_layers(self) -> Self;
}
