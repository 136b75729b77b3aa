//! One unit of training data: an image tuple plus optional correspondences.

use std::collections::BTreeMap;

use burn::prelude::*;

/// Correspondence tensors keyed by field name, e.g. `"a"` / `"b"` pixel
/// coordinates of shape `(n, matches, 2)`.
pub type Correspondences<B> = BTreeMap<String, Tensor<B, 3>>;

/// Image field of a batch: a lone tensor or an ordered tuple of them.
#[derive(Debug, Clone)]
pub enum Images<B: Backend> {
    Single(Tensor<B, 4>),
    Tuple(Vec<Tensor<B, 4>>),
}

impl<B: Backend> Images<B> {
    /// Normalize to tuple form.
    pub fn into_tuple(self) -> Vec<Tensor<B, 4>> {
        match self {
            Self::Single(image) => vec![image],
            Self::Tuple(images) => images,
        }
    }
}

/// A batch as yielded by a data source, possibly on another device.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    pub images: Images<B>,
    /// Empty when the batch carries no ground-truth matches.
    pub correspondences: Correspondences<B>,
}

impl<B: Backend> Batch<B> {
    pub fn new(images: Images<B>, correspondences: Correspondences<B>) -> Self {
        Self {
            images,
            correspondences,
        }
    }

    /// Batch without correspondence fields.
    pub fn images_only(images: Images<B>) -> Self {
        Self::new(images, Correspondences::new())
    }

    /// Normalize the image field to a tuple, move every tensor to `device`, and
    /// map an empty correspondence set to `None`.
    pub fn into_device(self, device: &B::Device) -> (Vec<Tensor<B, 4>>, Option<Correspondences<B>>) {
        let images = self
            .images
            .into_tuple()
            .into_iter()
            .map(|image| image.to_device(device))
            .collect();

        let correspondences = if self.correspondences.is_empty() {
            None
        } else {
            Some(
                self.correspondences
                    .into_iter()
                    .map(|(key, tensor)| (key, tensor.to_device(device)))
                    .collect(),
            )
        };

        (images, correspondences)
    }
}
