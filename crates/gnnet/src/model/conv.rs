use burn::module::Param;
use burn::prelude::*;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::Distribution;

/// Configuration for a square-kernel 2D convolution.
#[derive(Config, Debug)]
pub struct ConvLayerConfig {
    /// Input channels.
    pub channels_in: usize,
    /// Output channels.
    pub channels_out: usize,
    /// Kernel side length. Padding is `kernel_size / 2` so stride 1 keeps the resolution.
    #[config(default = 3)]
    pub kernel_size: usize,
    /// Spatial stride.
    #[config(default = 1)]
    pub stride: usize,
}

/// 2D convolution with explicit weight/bias parameters.
///
/// Kept as a hand-rolled layer so the training loop can re-draw its weights
/// in place (`reinitialize`) without rebuilding the network.
#[derive(Module, Debug)]
pub struct ConvLayer<B: Backend> {
    /// Kernel, shape (channels_out, channels_in, k, k). Kaiming initialized.
    pub(crate) weight: Param<Tensor<B, 4>>,
    /// Bias, shape (channels_out,). Zero initialized.
    pub(crate) bias: Param<Tensor<B, 1>>,
    stride: usize,
    padding: usize,
}

impl ConvLayerConfig {
    /// Initialize a ConvLayer.
    ///
    /// Weight uses Kaiming (He) initialization: Normal(0, sqrt(2/fan_in)),
    /// with fan_in = channels_in * k * k. Bias is zero-initialized.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvLayer<B> {
        let k = self.kernel_size;
        let fan_in = self.channels_in * k * k;
        let std_dev = (2.0 / fan_in as f64).sqrt();
        let weight = Tensor::random(
            [self.channels_out, self.channels_in, k, k],
            Distribution::Normal(0.0, std_dev),
            device,
        );

        ConvLayer {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(Tensor::zeros([self.channels_out], device)),
            stride: self.stride,
            padding: k / 2,
        }
    }
}

impl<B: Backend> ConvLayer<B> {
    /// Input `(n, channels_in, h, w)` → output `(n, channels_out, h', w')`
    /// with `h' = (h + 2p - k) / stride + 1`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        conv2d(
            input,
            self.weight.val(),
            Some(self.bias.val()),
            ConvOptions::new(
                [self.stride, self.stride],
                [self.padding, self.padding],
                [1, 1],
                1,
            ),
        )
    }

    /// Standard deviation of the Xavier (Glorot) normal scheme for this kernel:
    /// sqrt(2 / (fan_in + fan_out)).
    pub fn xavier_std(&self) -> f64 {
        let [c_out, c_in, kh, kw] = self.weight.val().dims();
        let fan_in = c_in * kh * kw;
        let fan_out = c_out * kh * kw;
        (2.0 / (fan_in + fan_out) as f64).sqrt()
    }

    /// Re-draw the kernel from Xavier-normal and zero the bias.
    pub fn reinitialize(self) -> Self {
        let weight = self.weight.val();
        let device = weight.device();
        let dims = weight.dims();
        let std_dev = self.xavier_std();

        Self {
            weight: Param::from_tensor(Tensor::random(
                dims,
                Distribution::Normal(0.0, std_dev),
                &device,
            )),
            bias: Param::from_tensor(Tensor::zeros([dims[0]], &device)),
            ..self
        }
    }
}
