use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::model::conv::{ConvLayer, ConvLayerConfig};
use crate::model::{ModelOutput, PairModel, NUM_LEVELS};

/// Configuration for the siamese feature pyramid.
///
/// ```text
/// (n, channels_in, h, w)
///   → Conv3x3(channels_in→feature_dim)            → ReLU → level 0: (n, d, h,   w)
///   → Conv3x3(feature_dim→feature_dim, stride 2)  → ReLU → level 1: (n, d, h/2, w/2)
///   → Conv3x3(feature_dim→feature_dim, stride 2)  → ReLU → level 2: (n, d, h/4, w/4)
///   → Conv3x3(feature_dim→feature_dim, stride 2)  → ReLU → level 3: (n, d, h/8, w/8)
/// ```
#[derive(Config, Debug)]
pub struct GnNetConfig {
    /// Image channels.
    #[config(default = 3)]
    pub channels_in: usize,
    /// Channels of every pyramid level.
    #[config(default = 16)]
    pub feature_dim: usize,
}

/// Per-image encoder producing one feature map per level, finest first.
#[derive(Module, Debug)]
pub struct PyramidEncoder<B: Backend> {
    /// Full-resolution stem.
    stem: ConvLayer<B>,
    /// Stride-2 stages producing levels 1..NUM_LEVELS.
    stages: Vec<ConvLayer<B>>,
}

/// Siamese network: the same encoder applied to every image of the tuple.
#[derive(Module, Debug)]
pub struct GnNet<B: Backend> {
    encoder: PyramidEncoder<B>,
}

impl GnNetConfig {
    /// Initialize a GnNet with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> GnNet<B> {
        let d = self.feature_dim;
        let stages = (1..NUM_LEVELS)
            .map(|_| ConvLayerConfig::new(d, d).with_stride(2).init(device))
            .collect();

        GnNet {
            encoder: PyramidEncoder {
                stem: ConvLayerConfig::new(self.channels_in, d).init(device),
                stages,
            },
        }
    }
}

impl<B: Backend> PyramidEncoder<B> {
    /// Returns `NUM_LEVELS` maps, level `l` at stride `2^l`.
    pub fn forward(&self, image: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut levels = Vec::with_capacity(NUM_LEVELS);
        let mut x = relu(self.stem.forward(image));
        levels.push(x.clone());
        for stage in &self.stages {
            x = relu(stage.forward(x));
            levels.push(x.clone());
        }
        levels
    }

    fn reinitialize(self) -> Self {
        Self {
            stem: self.stem.reinitialize(),
            stages: self.stages.into_iter().map(ConvLayer::reinitialize).collect(),
        }
    }
}

impl<B: Backend> PairModel<B> for GnNet<B> {
    /// Output layout: image 0 levels 0..3, then image 1 levels 0..3, and so on.
    fn forward_pair(&self, images: Vec<Tensor<B, 4>>) -> ModelOutput<B> {
        let mut tensors = Vec::with_capacity(images.len() * NUM_LEVELS);
        for image in images {
            tensors.extend(self.encoder.forward(image));
        }
        ModelOutput::new(tensors)
    }

    fn reinit_conv_layers(self) -> Self {
        Self {
            encoder: self.encoder.reinitialize(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_pair_output_layout() {
        let device = Default::default();
        let model = GnNetConfig::new()
            .with_channels_in(1)
            .with_feature_dim(4)
            .init::<TestBackend>(&device);
        let a = Tensor::<TestBackend, 4>::random([2, 1, 32, 24], Distribution::Default, &device);
        let b = Tensor::<TestBackend, 4>::random([2, 1, 32, 24], Distribution::Default, &device);

        let output = model.forward_pair(vec![a, b]);
        assert_eq!(output.len(), 2 * NUM_LEVELS);

        let expected = [[2, 4, 32, 24], [2, 4, 16, 12], [2, 4, 8, 6], [2, 4, 4, 3]];
        for image in 0..2 {
            for (level, dims) in expected.iter().enumerate() {
                let t = output.get(image * NUM_LEVELS + level).unwrap();
                assert_eq!(&t.dims(), dims, "image {image} level {level}");
            }
        }
    }

    #[test]
    fn test_shared_weights_across_images() {
        let device = Default::default();
        let model = GnNetConfig::new()
            .with_channels_in(1)
            .with_feature_dim(4)
            .init::<TestBackend>(&device);
        let image = Tensor::<TestBackend, 4>::random([1, 1, 16, 16], Distribution::Default, &device);

        let output = model.forward_pair(vec![image.clone(), image]);
        for level in 0..NUM_LEVELS {
            let a = output.get(level).unwrap().clone();
            let b = output.get(NUM_LEVELS + level).unwrap().clone();
            let diff: f32 = (a - b).abs().max().into_scalar().elem();
            assert!(diff < 1e-6, "level {level} differs by {diff}");
        }
    }

    #[test]
    fn test_reinit_touches_every_layer() {
        let device = Default::default();
        let model = GnNetConfig::new()
            .with_channels_in(1)
            .with_feature_dim(4)
            .init::<TestBackend>(&device);
        let before: Vec<_> = std::iter::once(&model.encoder.stem)
            .chain(model.encoder.stages.iter())
            .map(|layer| layer.weight.val())
            .collect();

        let model = model.reinit_conv_layers();
        let after: Vec<_> = std::iter::once(&model.encoder.stem)
            .chain(model.encoder.stages.iter())
            .collect();

        assert_eq!(after.len(), NUM_LEVELS);
        for (old, layer) in before.into_iter().zip(after) {
            let diff: f32 = (layer.weight.val() - old).abs().sum().into_scalar().elem();
            assert!(diff > 0.0, "layer weights unchanged after reinit");
            let bias: f32 = layer.bias.val().abs().sum().into_scalar().elem();
            assert_eq!(bias, 0.0);
        }
    }

    #[test]
    fn test_gradient_reaches_stem() {
        use burn::optim::GradientsParams;

        let device = Default::default();
        let model = GnNetConfig::new()
            .with_channels_in(1)
            .with_feature_dim(4)
            .init::<TestAutodiffBackend>(&device);
        let image = Tensor::<TestAutodiffBackend, 4>::random(
            [1, 1, 16, 16],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let output = model.forward_pair(vec![image]);
        let loss = output
            .tensors()
            .iter()
            .map(|t| t.clone().sum())
            .reduce(|acc, s| acc + s)
            .unwrap();
        let grads = GradientsParams::from_grads(loss.backward(), &model);

        let stem_grad = grads
            .get::<NdArray<f32>, 4>(model.encoder.stem.weight.id)
            .expect("stem weight should have gradient");
        let grad_sum: f32 = stem_grad.abs().sum().into_scalar().elem();
        assert!(grad_sum > 0.0, "stem gradient is zero");
    }
}
